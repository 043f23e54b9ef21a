use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::{
    realtime,
    sanitize::{self, MAX_KEYWORD, MAX_REPLY_TEXT, MAX_TICKET_BODY},
    store,
    types::{AppState, BotConfig, BotRule, BotSchedule, ChatMessage, Conversation, PutBotConfigBody, Ticket},
};

/// Window for the generic identical-text de-dup guard, independent of
/// any per-rule cooldown.
pub const DUPLICATE_GUARD_SECONDS: i64 = 20;

pub const BOT_AUDIT_ACTION: &str = "BOT_AUTO_REPLY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplySource {
    Rule(BotRule),
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressReason {
    Disabled,
    OutsideSchedule,
    PausedAssigned,
    Blacklisted(String),
    WhitelistMiss,
    NoMatch,
}

impl SuppressReason {
    fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::Disabled => "disabled",
            SuppressReason::OutsideSchedule => "outside_schedule",
            SuppressReason::PausedAssigned => "paused_assigned",
            SuppressReason::Blacklisted(_) => "blacklisted",
            SuppressReason::WhitelistMiss => "whitelist_miss",
            SuppressReason::NoMatch => "no_match",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotDecision {
    Reply { text: String, source: ReplySource },
    Suppressed(SuppressReason),
}

fn parse_hhmm(value: &str) -> Option<u32> {
    let (hours, minutes) = value.split_once(':')?;
    let hours = hours.parse::<u32>().ok()?;
    let minutes = minutes.parse::<u32>().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

fn schedule_window_matches(schedule: &BotSchedule, weekday: u8, minute_of_day: u32) -> bool {
    if !schedule.enabled || !schedule.weekdays.contains(&weekday) {
        return false;
    }
    let (Some(start), Some(end)) = (parse_hhmm(&schedule.start), parse_hhmm(&schedule.end)) else {
        return false;
    };
    if start <= end {
        minute_of_day >= start && minute_of_day < end
    } else {
        // Overnight wrap, e.g. 22:00-06:00.
        minute_of_day >= start || minute_of_day < end
    }
}

/// Whether any enabled schedule window covers `now` after shifting by
/// the configured timezone offset. Weekdays use 0 = Sunday.
pub fn schedule_allows(config: &BotConfig, now: DateTime<Utc>) -> bool {
    let shifted = now + Duration::minutes(config.timezone_offset_minutes);
    let weekday = shifted.weekday().num_days_from_sunday() as u8;
    let minute_of_day = shifted.hour() * 60 + shifted.minute();
    config
        .schedules
        .iter()
        .any(|schedule| schedule_window_matches(schedule, weekday, minute_of_day))
}

fn rule_matches(rule: &BotRule, body_lower: &str) -> bool {
    let keyword = rule.keyword.trim().to_lowercase();
    if keyword.is_empty() {
        return false;
    }
    match rule.match_mode.as_str() {
        "equals" => body_lower.trim() == keyword,
        _ => body_lower.contains(&keyword),
    }
}

/// Highest priority wins; ties keep the first rule in load order.
fn best_rule<'a>(rules: &'a [BotRule], body_lower: &str) -> Option<&'a BotRule> {
    let mut best: Option<&BotRule> = None;
    for rule in rules {
        if !rule.enabled || !rule_matches(rule, body_lower) {
            continue;
        }
        match best {
            Some(current) if current.priority >= rule.priority => {}
            _ => best = Some(rule),
        }
    }
    best
}

/// The pure decision: everything up to (but not including) the cooldown
/// and duplicate guards, which need storage.
pub fn evaluate(config: &BotConfig, body: &str, assigned: bool, now: DateTime<Utc>) -> BotDecision {
    if !config.enabled {
        return BotDecision::Suppressed(SuppressReason::Disabled);
    }
    if config.schedule_enforced && !schedule_allows(config, now) {
        return BotDecision::Suppressed(SuppressReason::OutsideSchedule);
    }
    if config.pause_when_assigned && assigned {
        return BotDecision::Suppressed(SuppressReason::PausedAssigned);
    }

    let body_lower = body.to_lowercase();

    // Lowercase at comparison time: config saved through the REST path
    // arrives lowered already, directly seeded rows may not be.
    let keyword_hits = |kw: &String| {
        let kw = kw.trim().to_lowercase();
        !kw.is_empty() && body_lower.contains(&kw)
    };

    if let Some(hit) = config.blacklist.iter().find(|kw| keyword_hits(kw)) {
        return BotDecision::Suppressed(SuppressReason::Blacklisted(hit.clone()));
    }

    // With a non-empty whitelist, a miss ends the evaluation entirely;
    // the offline fallback only applies when the whitelist is empty.
    let whitelist_active = !config.whitelist.is_empty();
    if whitelist_active && !config.whitelist.iter().any(keyword_hits) {
        return BotDecision::Suppressed(SuppressReason::WhitelistMiss);
    }

    if let Some(rule) = best_rule(&config.rules, &body_lower) {
        return BotDecision::Reply {
            text: rule.reply.clone(),
            source: ReplySource::Rule(rule.clone()),
        };
    }

    if !whitelist_active && !assigned && config.offline_enabled && !config.offline_text.is_empty() {
        return BotDecision::Reply {
            text: config.offline_text.clone(),
            source: ReplySource::Offline,
        };
    }

    BotDecision::Suppressed(SuppressReason::NoMatch)
}

/// Normalize an inbound full-document config replace: keywords are
/// lowercased, strings bounded, rules without keywords dropped, missing
/// rule/schedule ids minted. Oversized input shrinks instead of erroring.
pub fn normalize_config(body: PutBotConfigBody) -> BotConfig {
    let clean_keywords = |list: Vec<String>| -> Vec<String> {
        list.into_iter()
            .map(|kw| sanitize::normalize_keyword(&kw))
            .filter(|kw| !kw.is_empty())
            .collect()
    };

    let rules = body
        .rules
        .into_iter()
        .filter_map(|rule| {
            let keyword = sanitize::normalize_keyword(&rule.keyword);
            if keyword.is_empty() {
                return None;
            }
            Some(BotRule {
                id: if rule.id.trim().is_empty() {
                    Uuid::new_v4().to_string()
                } else {
                    sanitize::clean_line(&rule.id, MAX_KEYWORD)
                },
                keyword,
                reply: sanitize::clean_text(&rule.reply, MAX_REPLY_TEXT),
                enabled: rule.enabled,
                priority: rule.priority,
                match_mode: if rule.match_mode == "equals" {
                    "equals".to_string()
                } else {
                    "contains".to_string()
                },
                group: sanitize::clean_line(&rule.group, MAX_KEYWORD),
                cooldown_seconds: rule.cooldown_seconds.max(0),
                auto_tag: sanitize::clean_line(&rule.auto_tag, sanitize::MAX_TAG),
                create_ticket: rule.create_ticket,
            })
        })
        .collect();

    let schedules = body
        .schedules
        .into_iter()
        .map(|schedule| BotSchedule {
            id: if schedule.id.trim().is_empty() {
                Uuid::new_v4().to_string()
            } else {
                sanitize::clean_line(&schedule.id, MAX_KEYWORD)
            },
            weekdays: schedule
                .weekdays
                .into_iter()
                .filter(|day| *day <= 6)
                .collect(),
            start: sanitize::clean_line(&schedule.start, 5),
            end: sanitize::clean_line(&schedule.end, 5),
            enabled: schedule.enabled,
        })
        .collect();

    BotConfig {
        enabled: body.enabled,
        welcome_enabled: body.welcome_enabled,
        welcome_text: sanitize::clean_text(&body.welcome_text, MAX_REPLY_TEXT),
        offline_enabled: body.offline_enabled,
        offline_text: sanitize::clean_text(&body.offline_text, MAX_REPLY_TEXT),
        pause_when_assigned: body.pause_when_assigned,
        schedule_enforced: body.schedule_enforced,
        timezone_offset_minutes: body.timezone_offset_minutes.clamp(-14 * 60, 14 * 60),
        whitelist: clean_keywords(body.whitelist),
        blacklist: clean_keywords(body.blacklist),
        rules,
        schedules,
        updated_at: store::now_iso(),
    }
}

/// Guard (a): a rule with a cooldown may not fire again in the same
/// conversation until the interval has fully elapsed.
pub fn rule_cooldown_allows(
    cooldown_seconds: i64,
    last_fired: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if cooldown_seconds <= 0 {
        return true;
    }
    match last_fired {
        Some(fired_at) => now - fired_at >= Duration::seconds(cooldown_seconds),
        None => true,
    }
}

/// Guard (b): identical text to the latest system message inside the
/// fixed window is muted, catching racing double-fires across rules.
pub fn duplicate_guard_allows(last_system: Option<&ChatMessage>, text: &str, now: DateTime<Utc>) -> bool {
    let Some(last) = last_system else {
        return true;
    };
    if last.body != text {
        return true;
    }
    match DateTime::parse_from_rfc3339(&last.created_at) {
        Ok(created) => now - created.with_timezone(&Utc) >= Duration::seconds(DUPLICATE_GUARD_SECONDS),
        Err(_) => true,
    }
}

pub async fn cached_bot_config(state: &Arc<AppState>) -> BotConfig {
    if let Some(config) = state.bot_cache.get() {
        return config;
    }
    let config = store::load_bot_config(&state.db).await;
    state.bot_cache.store(config.clone());
    config
}

async fn send_system_message(
    state: &Arc<AppState>,
    conversation: &Conversation,
    text: &str,
) -> Option<ChatMessage> {
    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation.id.clone(),
        sender: "system".to_string(),
        agent_id: None,
        body: text.to_string(),
        ip: String::new(),
        session_id: conversation.visitor_session_id.clone(),
        created_at: store::now_iso(),
    };
    if let Err(err) = store::insert_message(&state.db, &message).await {
        tracing::error!(conversation_id = %conversation.id, error = %err, "bot reply persist failed");
        return None;
    }
    store::touch_conversation(&state.db, &conversation.id).await;
    realtime::broadcast_to_conversation(state, &conversation.id, "message_new", &message).await;
    Some(message)
}

async fn audit_decision(
    state: &Arc<AppState>,
    conversation: &Conversation,
    detail: serde_json::Value,
) {
    store::record_event(
        &state.db,
        "system",
        None,
        BOT_AUDIT_ACTION,
        "",
        Some(conversation.visitor_session_id.as_str()),
        Some(conversation.id.as_str()),
        detail,
    )
    .await;
}

/// Evaluate one visitor message and apply the outcome. Guard checks and
/// side effects live here; the decision itself is `evaluate`. Every
/// path, including every suppression, writes an audit event.
pub async fn run_for_visitor_message(state: Arc<AppState>, conversation: Conversation, body: String) {
    let config = cached_bot_config(&state).await;
    let assigned = conversation.assigned_agent_id.is_some();
    let now = Utc::now();

    let decision = evaluate(&config, &body, assigned, now);
    let (text, source) = match decision {
        BotDecision::Suppressed(reason) => {
            let mut detail = json!({ "outcome": "suppressed", "reason": reason.as_str() });
            if let SuppressReason::Blacklisted(keyword) = &reason {
                detail["keyword"] = json!(keyword);
            }
            audit_decision(&state, &conversation, detail).await;
            return;
        }
        BotDecision::Reply { text, source } => (text, source),
    };

    // Both guards must independently allow the send.
    if let ReplySource::Rule(rule) = &source {
        if rule.cooldown_seconds > 0 {
            let last_fired = store::last_rule_fire(&state.db, &conversation.id, &rule.id).await;
            if !rule_cooldown_allows(rule.cooldown_seconds, last_fired, now) {
                audit_decision(
                    &state,
                    &conversation,
                    json!({
                        "outcome": "suppressed",
                        "reason": "rule_cooldown",
                        "ruleId": rule.id,
                        "keyword": rule.keyword,
                    }),
                )
                .await;
                return;
            }
        }
    }

    let last_system = store::last_system_message(&state.db, &conversation.id).await;
    if !duplicate_guard_allows(last_system.as_ref(), &text, now) {
        audit_decision(
            &state,
            &conversation,
            json!({ "outcome": "suppressed", "reason": "duplicate_text" }),
        )
        .await;
        return;
    }

    if send_system_message(&state, &conversation, &text).await.is_none() {
        return;
    }

    match &source {
        ReplySource::Rule(rule) => {
            store::record_rule_fire(&state.db, &conversation.id, &rule.id).await;
            if !rule.auto_tag.is_empty() {
                store::attach_tag(&state.db, &conversation.id, &rule.auto_tag).await;
            }
            if rule.create_ticket {
                let now_str = store::now_iso();
                let ticket = Ticket {
                    id: Uuid::new_v4().to_string(),
                    visitor_session_id: conversation.visitor_session_id.clone(),
                    conversation_id: Some(conversation.id.clone()),
                    ip: conversation.visitor_ip.clone(),
                    user_agent: conversation.visitor_user_agent.clone(),
                    contact: String::new(),
                    body: sanitize::clean_text(&body, MAX_TICKET_BODY),
                    status: "open".to_string(),
                    created_at: now_str.clone(),
                    updated_at: now_str,
                };
                if let Err(err) = store::insert_ticket(&state.db, &ticket).await {
                    tracing::error!(conversation_id = %conversation.id, error = %err, "bot ticket create failed");
                }
            }
            audit_decision(
                &state,
                &conversation,
                json!({
                    "outcome": "sent",
                    "path": "rule",
                    "ruleId": rule.id,
                    "keyword": rule.keyword,
                    "priority": rule.priority,
                    "group": rule.group,
                    "autoTag": rule.auto_tag,
                    "ticketCreated": rule.create_ticket,
                }),
            )
            .await;
        }
        ReplySource::Offline => {
            audit_decision(
                &state,
                &conversation,
                json!({ "outcome": "sent", "path": "offline" }),
            )
            .await;
        }
    }
}

/// Welcome message on a session's very first contact, sent through the
/// same system-message path as rule replies.
pub async fn send_welcome(state: &Arc<AppState>, conversation: &Conversation) {
    let config = cached_bot_config(state).await;
    if !config.enabled || !config.welcome_enabled || config.welcome_text.is_empty() {
        return;
    }
    if send_system_message(state, conversation, &config.welcome_text).await.is_some() {
        audit_decision(
            state,
            conversation,
            json!({ "outcome": "sent", "path": "welcome" }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rule(id: &str, keyword: &str, reply: &str, priority: i64) -> BotRule {
        BotRule {
            id: id.to_string(),
            keyword: keyword.to_string(),
            reply: reply.to_string(),
            enabled: true,
            priority,
            match_mode: "contains".to_string(),
            group: String::new(),
            cooldown_seconds: 0,
            auto_tag: String::new(),
            create_ticket: false,
        }
    }

    fn enabled_config() -> BotConfig {
        BotConfig {
            enabled: true,
            pause_when_assigned: true,
            ..BotConfig::default()
        }
    }

    fn weekday_schedule() -> BotSchedule {
        BotSchedule {
            id: "s1".to_string(),
            weekdays: vec![1, 2, 3, 4, 5],
            start: "09:00".to_string(),
            end: "18:00".to_string(),
            enabled: true,
        }
    }

    // 2026-08-25 is a Tuesday, 2026-08-29 a Saturday.
    fn tuesday_10() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 25, 10, 0, 0).unwrap()
    }

    fn saturday_10() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 29, 10, 0, 0).unwrap()
    }

    #[test]
    fn disabled_config_never_replies() {
        let config = BotConfig::default();
        assert_eq!(
            evaluate(&config, "hello", false, tuesday_10()),
            BotDecision::Suppressed(SuppressReason::Disabled)
        );
    }

    #[test]
    fn schedule_gates_weekends_out() {
        let mut config = enabled_config();
        config.schedule_enforced = true;
        config.schedules = vec![weekday_schedule()];
        config.rules = vec![rule("r1", "hello", "hi there", 0)];

        assert_eq!(
            evaluate(&config, "hello", false, saturday_10()),
            BotDecision::Suppressed(SuppressReason::OutsideSchedule)
        );
        assert!(matches!(
            evaluate(&config, "hello", false, tuesday_10()),
            BotDecision::Reply { .. }
        ));
    }

    #[test]
    fn schedule_respects_timezone_offset() {
        let mut config = enabled_config();
        config.schedule_enforced = true;
        config.schedules = vec![weekday_schedule()];
        config.rules = vec![rule("r1", "hello", "hi", 0)];
        // 08:30 UTC is outside, but +60 minutes puts it at 09:30 local.
        let early = Utc.with_ymd_and_hms(2026, 8, 25, 8, 30, 0).unwrap();
        assert!(matches!(
            evaluate(&config, "hello", false, early),
            BotDecision::Suppressed(SuppressReason::OutsideSchedule)
        ));
        config.timezone_offset_minutes = 60;
        assert!(matches!(
            evaluate(&config, "hello", false, early),
            BotDecision::Reply { .. }
        ));
    }

    #[test]
    fn overnight_window_wraps_past_midnight() {
        let schedule = BotSchedule {
            id: "night".to_string(),
            weekdays: vec![2],
            start: "22:00".to_string(),
            end: "06:00".to_string(),
            enabled: true,
        };
        assert!(schedule_window_matches(&schedule, 2, 23 * 60));
        assert!(schedule_window_matches(&schedule, 2, 3 * 60));
        assert!(!schedule_window_matches(&schedule, 2, 12 * 60));
        assert!(!schedule_window_matches(&schedule, 3, 23 * 60));
    }

    #[test]
    fn pause_when_assigned_suppresses() {
        let mut config = enabled_config();
        config.rules = vec![rule("r1", "hello", "hi", 0)];
        assert_eq!(
            evaluate(&config, "hello", true, tuesday_10()),
            BotDecision::Suppressed(SuppressReason::PausedAssigned)
        );
        config.pause_when_assigned = false;
        assert!(matches!(
            evaluate(&config, "hello", true, tuesday_10()),
            BotDecision::Reply { .. }
        ));
    }

    #[test]
    fn blacklist_beats_whitelist_and_rules() {
        let mut config = enabled_config();
        config.whitelist = vec!["refund".to_string()];
        config.blacklist = vec!["spamword".to_string()];
        config.rules = vec![rule("r1", "refund", "refund info", 0)];
        assert_eq!(
            evaluate(&config, "refund spamword please", false, tuesday_10()),
            BotDecision::Suppressed(SuppressReason::Blacklisted("spamword".to_string()))
        );
    }

    #[test]
    fn whitelist_miss_skips_rules_and_offline() {
        let mut config = enabled_config();
        config.whitelist = vec!["billing".to_string()];
        config.offline_enabled = true;
        config.offline_text = "we will reply soon".to_string();
        config.rules = vec![rule("r1", "hello", "hi", 0)];
        assert_eq!(
            evaluate(&config, "hello there", false, tuesday_10()),
            BotDecision::Suppressed(SuppressReason::WhitelistMiss)
        );
    }

    #[test]
    fn offline_fallback_when_whitelist_empty_and_unassigned() {
        let mut config = enabled_config();
        config.offline_enabled = true;
        config.offline_text = "we will reply soon".to_string();
        match evaluate(&config, "anything at all", false, tuesday_10()) {
            BotDecision::Reply { text, source } => {
                assert_eq!(text, "we will reply soon");
                assert_eq!(source, ReplySource::Offline);
            }
            other => panic!("expected offline reply, got {other:?}"),
        }
        // Assigned conversations get no offline fallback.
        config.pause_when_assigned = false;
        assert_eq!(
            evaluate(&config, "anything", true, tuesday_10()),
            BotDecision::Suppressed(SuppressReason::NoMatch)
        );
    }

    #[test]
    fn higher_priority_rule_wins() {
        let mut config = enabled_config();
        config.rules = vec![
            rule("low", "price", "low priority", 1),
            rule("high", "price", "high priority", 5),
        ];
        match evaluate(&config, "what is the price?", false, tuesday_10()) {
            BotDecision::Reply { source: ReplySource::Rule(rule), .. } => {
                assert_eq!(rule.id, "high");
            }
            other => panic!("expected rule reply, got {other:?}"),
        }
    }

    #[test]
    fn priority_ties_keep_load_order() {
        let mut config = enabled_config();
        config.rules = vec![
            rule("first", "price", "first", 3),
            rule("second", "price", "second", 3),
        ];
        match evaluate(&config, "price?", false, tuesday_10()) {
            BotDecision::Reply { source: ReplySource::Rule(rule), .. } => {
                assert_eq!(rule.id, "first");
            }
            other => panic!("expected rule reply, got {other:?}"),
        }
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut config = enabled_config();
        let mut disabled = rule("off", "price", "off", 9);
        disabled.enabled = false;
        config.rules = vec![disabled, rule("on", "price", "on", 1)];
        match evaluate(&config, "price", false, tuesday_10()) {
            BotDecision::Reply { source: ReplySource::Rule(rule), .. } => {
                assert_eq!(rule.id, "on");
            }
            other => panic!("expected rule reply, got {other:?}"),
        }
    }

    #[test]
    fn equals_mode_requires_full_match() {
        let mut config = enabled_config();
        let mut exact = rule("exact", "hours", "9 to 5", 0);
        exact.match_mode = "equals".to_string();
        config.rules = vec![exact];
        assert!(matches!(
            evaluate(&config, "  HOURS ", false, tuesday_10()),
            BotDecision::Reply { .. }
        ));
        assert_eq!(
            evaluate(&config, "what are your hours", false, tuesday_10()),
            BotDecision::Suppressed(SuppressReason::NoMatch)
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        let mut config = enabled_config();
        config.rules = vec![rule("r1", "refund", "refund info", 0)];
        assert!(matches!(
            evaluate(&config, "I want a REFUND now", false, tuesday_10()),
            BotDecision::Reply { .. }
        ));
    }

    #[test]
    fn normalize_config_drops_empty_keywords_and_bounds_text() {
        let body = PutBotConfigBody {
            enabled: true,
            welcome_enabled: false,
            welcome_text: String::new(),
            offline_enabled: false,
            offline_text: String::new(),
            pause_when_assigned: true,
            schedule_enforced: false,
            timezone_offset_minutes: 99_999,
            whitelist: vec!["  Billing ".to_string(), "  ".to_string()],
            blacklist: vec![],
            rules: vec![
                BotRule {
                    id: String::new(),
                    keyword: "  ".to_string(),
                    reply: "dropped".to_string(),
                    enabled: true,
                    priority: 0,
                    match_mode: "contains".to_string(),
                    group: String::new(),
                    cooldown_seconds: -5,
                    auto_tag: String::new(),
                    create_ticket: false,
                },
                BotRule {
                    id: String::new(),
                    keyword: "Refund".to_string(),
                    reply: "x".repeat(MAX_REPLY_TEXT + 50),
                    enabled: true,
                    priority: 0,
                    match_mode: "weird".to_string(),
                    group: String::new(),
                    cooldown_seconds: 30,
                    auto_tag: String::new(),
                    create_ticket: false,
                },
            ],
            schedules: vec![BotSchedule {
                id: String::new(),
                weekdays: vec![0, 3, 9],
                start: "09:00".to_string(),
                end: "18:00".to_string(),
                enabled: true,
            }],
        };
        let config = normalize_config(body);
        assert_eq!(config.whitelist, vec!["billing".to_string()]);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].keyword, "refund");
        assert_eq!(config.rules[0].match_mode, "contains");
        assert_eq!(config.rules[0].cooldown_seconds, 30);
        assert_eq!(config.rules[0].reply.chars().count(), MAX_REPLY_TEXT);
        assert!(!config.rules[0].id.is_empty());
        assert_eq!(config.schedules[0].weekdays, vec![0, 3]);
        assert_eq!(config.timezone_offset_minutes, 14 * 60);
    }

    #[test]
    fn seeded_uppercase_list_keywords_still_match() {
        let mut config = enabled_config();
        config.blacklist = vec!["SpamWord".to_string()];
        config.rules = vec![rule("r1", "refund", "refund info", 0)];
        assert_eq!(
            evaluate(&config, "spamword refund", false, tuesday_10()),
            BotDecision::Suppressed(SuppressReason::Blacklisted("SpamWord".to_string()))
        );

        config.blacklist = vec![];
        config.whitelist = vec!["Refund".to_string()];
        assert!(matches!(
            evaluate(&config, "refund please", false, tuesday_10()),
            BotDecision::Reply { .. }
        ));
    }

    #[test]
    fn rule_cooldown_blocks_until_elapsed() {
        let now = tuesday_10();
        assert!(rule_cooldown_allows(0, Some(now), now));
        assert!(rule_cooldown_allows(30, None, now));
        assert!(!rule_cooldown_allows(30, Some(now - Duration::seconds(10)), now));
        assert!(rule_cooldown_allows(30, Some(now - Duration::seconds(30)), now));
    }

    fn system_message(body: &str, sent_at: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            sender: "system".to_string(),
            agent_id: None,
            body: body.to_string(),
            ip: String::new(),
            session_id: String::new(),
            created_at: sent_at.to_rfc3339(),
        }
    }

    #[test]
    fn identical_text_muted_inside_window() {
        let now = tuesday_10();
        assert!(duplicate_guard_allows(None, "hi there", now));

        let recent = system_message("hi there", now - Duration::seconds(5));
        assert!(!duplicate_guard_allows(Some(&recent), "hi there", now));
        // Different text inside the window is fine.
        assert!(duplicate_guard_allows(Some(&recent), "other reply", now));

        let stale = system_message("hi there", now - Duration::seconds(DUPLICATE_GUARD_SECONDS));
        assert!(duplicate_guard_allows(Some(&stale), "hi there", now));
    }
}
