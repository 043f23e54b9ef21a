use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::types::{
    AuditEvent, BotConfig, BotRule, BotSchedule, CannedReply, ChatMessage, Conversation, IpBlock,
    Note, QueueEntry, Ticket,
};

pub const HISTORY_LIMIT: i64 = 50;
pub const BOT_CONFIG_NAME: &str = "default";

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ---- audit -----------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub async fn record_event(
    pool: &PgPool,
    actor_kind: &str,
    actor_id: Option<&str>,
    action: &str,
    ip: &str,
    session_id: Option<&str>,
    conversation_id: Option<&str>,
    detail: Value,
) {
    let detail_text = serde_json::to_string(&detail).unwrap_or_else(|_| "{}".to_string());
    let result = sqlx::query(
        "INSERT INTO events (id, actor_kind, actor_id, action, ip, session_id, conversation_id, detail, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(actor_kind)
    .bind(actor_id)
    .bind(action)
    .bind(ip)
    .bind(session_id)
    .bind(conversation_id)
    .bind(detail_text)
    .bind(now_iso())
    .execute(pool)
    .await;
    if let Err(err) = result {
        tracing::error!(action, error = %err, "audit event write failed");
    }
}

fn parse_event_row(row: PgRow) -> AuditEvent {
    AuditEvent {
        id: row.get("id"),
        actor_kind: row.get("actor_kind"),
        actor_id: row.get("actor_id"),
        action: row.get("action"),
        ip: row.get("ip"),
        session_id: row.get("session_id"),
        conversation_id: row.get("conversation_id"),
        detail: serde_json::from_str(&row.get::<String, _>("detail")).unwrap_or(Value::Null),
        created_at: row.get("created_at"),
    }
}

pub async fn recent_events_by_action(pool: &PgPool, action: &str, limit: i64) -> Vec<AuditEvent> {
    let rows = sqlx::query(
        "SELECT id, actor_kind, actor_id, action, ip, session_id, conversation_id, detail, created_at \
         FROM events WHERE action = $1 ORDER BY created_at DESC LIMIT $2",
    )
    .bind(action)
    .bind(limit)
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    rows.into_iter().map(parse_event_row).collect()
}

// ---- conversations ---------------------------------------------------

fn parse_conversation_row(row: PgRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        visitor_session_id: row.get("visitor_session_id"),
        visitor_ip: row.get("visitor_ip"),
        visitor_user_agent: row.get("visitor_user_agent"),
        entry_url: row.get("entry_url"),
        referrer: row.get("referrer"),
        status: row.get("status"),
        assigned_agent_id: row.get("assigned_agent_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        closed_at: row.get("closed_at"),
    }
}

const CONVERSATION_COLUMNS: &str = "id, visitor_session_id, visitor_ip, visitor_user_agent, \
     entry_url, referrer, status, assigned_agent_id, created_at, updated_at, closed_at";

pub async fn get_conversation(pool: &PgPool, id: &str) -> Option<Conversation> {
    let row = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()?;
    Some(parse_conversation_row(row))
}

/// The one conversation a visitor session may have in `open` or
/// `assigned` state, if any.
pub async fn find_live_conversation(pool: &PgPool, session_id: &str) -> Option<Conversation> {
    let row = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations \
         WHERE visitor_session_id = $1 AND status IN ('open','assigned') \
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(session_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()?;
    Some(parse_conversation_row(row))
}

pub async fn insert_conversation(
    pool: &PgPool,
    conversation: &Conversation,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO conversations (id, visitor_session_id, visitor_ip, visitor_user_agent, \
         entry_url, referrer, status, assigned_agent_id, created_at, updated_at, closed_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
    )
    .bind(&conversation.id)
    .bind(&conversation.visitor_session_id)
    .bind(&conversation.visitor_ip)
    .bind(&conversation.visitor_user_agent)
    .bind(&conversation.entry_url)
    .bind(&conversation.referrer)
    .bind(&conversation.status)
    .bind(&conversation.assigned_agent_id)
    .bind(&conversation.created_at)
    .bind(&conversation.updated_at)
    .bind(&conversation.closed_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn touch_conversation(pool: &PgPool, id: &str) {
    let _ = sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
        .bind(now_iso())
        .bind(id)
        .execute(pool)
        .await;
}

/// Idempotent: re-assigning to the same or another agent is allowed as
/// long as the conversation is not closed.
pub async fn assign_conversation(
    pool: &PgPool,
    id: &str,
    agent_id: &str,
) -> Option<Conversation> {
    let row = sqlx::query(&format!(
        "UPDATE conversations SET status = 'assigned', assigned_agent_id = $1, updated_at = $2 \
         WHERE id = $3 AND status IN ('open','assigned') RETURNING {CONVERSATION_COLUMNS}"
    ))
    .bind(agent_id)
    .bind(now_iso())
    .bind(id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()?;
    Some(parse_conversation_row(row))
}

pub async fn close_conversation(pool: &PgPool, id: &str) -> Option<Conversation> {
    let now = now_iso();
    let row = sqlx::query(&format!(
        "UPDATE conversations SET status = 'closed', closed_at = $1, updated_at = $1 \
         WHERE id = $2 AND status IN ('open','assigned') RETURNING {CONVERSATION_COLUMNS}"
    ))
    .bind(now)
    .bind(id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()?;
    Some(parse_conversation_row(row))
}

pub async fn session_conversation_count(pool: &PgPool, session_id: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM conversations WHERE visitor_session_id = $1",
    )
    .bind(session_id)
    .fetch_one(pool)
    .await
    .unwrap_or(0)
}

// ---- messages --------------------------------------------------------

fn parse_message_row(row: PgRow) -> ChatMessage {
    ChatMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender: row.get("sender"),
        agent_id: row.get("agent_id"),
        body: row.get("body"),
        ip: row.get("ip"),
        session_id: row.get("session_id"),
        created_at: row.get("created_at"),
    }
}

pub async fn insert_message(pool: &PgPool, message: &ChatMessage) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO messages (id, conversation_id, sender, agent_id, body, ip, session_id, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8) ON CONFLICT (id) DO NOTHING",
    )
    .bind(&message.id)
    .bind(&message.conversation_id)
    .bind(&message.sender)
    .bind(&message.agent_id)
    .bind(&message.body)
    .bind(&message.ip)
    .bind(&message.session_id)
    .bind(&message.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Bounded history snapshot: most-recent-first capped at `limit`,
/// returned oldest-first ready for delivery.
pub async fn conversation_history(pool: &PgPool, conversation_id: &str, limit: i64) -> Vec<ChatMessage> {
    let rows = sqlx::query(
        "SELECT id, conversation_id, sender, agent_id, body, ip, session_id, created_at \
         FROM messages WHERE conversation_id = $1 ORDER BY created_at DESC LIMIT $2",
    )
    .bind(conversation_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    let mut messages = rows.into_iter().map(parse_message_row).collect::<Vec<_>>();
    messages.reverse();
    messages
}

pub async fn last_system_message(pool: &PgPool, conversation_id: &str) -> Option<ChatMessage> {
    let row = sqlx::query(
        "SELECT id, conversation_id, sender, agent_id, body, ip, session_id, created_at \
         FROM messages WHERE conversation_id = $1 AND sender = 'system' \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()?;
    Some(parse_message_row(row))
}

// ---- bot config ------------------------------------------------------

pub async fn load_bot_config(pool: &PgPool) -> BotConfig {
    let row = sqlx::query(
        "SELECT enabled, welcome_enabled, welcome_text, offline_enabled, offline_text, \
         pause_when_assigned, schedule_enforced, timezone_offset_minutes, whitelist, blacklist, \
         rules, schedules, updated_at FROM bot_configs WHERE name = $1",
    )
    .bind(BOT_CONFIG_NAME)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten();

    let Some(row) = row else {
        return BotConfig::default();
    };

    BotConfig {
        enabled: row.get("enabled"),
        welcome_enabled: row.get("welcome_enabled"),
        welcome_text: row.get("welcome_text"),
        offline_enabled: row.get("offline_enabled"),
        offline_text: row.get("offline_text"),
        pause_when_assigned: row.get("pause_when_assigned"),
        schedule_enforced: row.get("schedule_enforced"),
        timezone_offset_minutes: row.get("timezone_offset_minutes"),
        whitelist: serde_json::from_str::<Vec<String>>(&row.get::<String, _>("whitelist"))
            .unwrap_or_default(),
        blacklist: serde_json::from_str::<Vec<String>>(&row.get::<String, _>("blacklist"))
            .unwrap_or_default(),
        rules: serde_json::from_str::<Vec<BotRule>>(&row.get::<String, _>("rules"))
            .unwrap_or_default(),
        schedules: serde_json::from_str::<Vec<BotSchedule>>(&row.get::<String, _>("schedules"))
            .unwrap_or_default(),
        updated_at: row.get("updated_at"),
    }
}

pub async fn save_bot_config(pool: &PgPool, config: &BotConfig) -> Result<(), sqlx::Error> {
    let whitelist = serde_json::to_string(&config.whitelist).unwrap_or_else(|_| "[]".to_string());
    let blacklist = serde_json::to_string(&config.blacklist).unwrap_or_else(|_| "[]".to_string());
    let rules = serde_json::to_string(&config.rules).unwrap_or_else(|_| "[]".to_string());
    let schedules = serde_json::to_string(&config.schedules).unwrap_or_else(|_| "[]".to_string());
    sqlx::query(
        "INSERT INTO bot_configs (name, enabled, welcome_enabled, welcome_text, offline_enabled, \
         offline_text, pause_when_assigned, schedule_enforced, timezone_offset_minutes, whitelist, \
         blacklist, rules, schedules, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14) \
         ON CONFLICT (name) DO UPDATE SET \
            enabled = EXCLUDED.enabled, \
            welcome_enabled = EXCLUDED.welcome_enabled, \
            welcome_text = EXCLUDED.welcome_text, \
            offline_enabled = EXCLUDED.offline_enabled, \
            offline_text = EXCLUDED.offline_text, \
            pause_when_assigned = EXCLUDED.pause_when_assigned, \
            schedule_enforced = EXCLUDED.schedule_enforced, \
            timezone_offset_minutes = EXCLUDED.timezone_offset_minutes, \
            whitelist = EXCLUDED.whitelist, \
            blacklist = EXCLUDED.blacklist, \
            rules = EXCLUDED.rules, \
            schedules = EXCLUDED.schedules, \
            updated_at = EXCLUDED.updated_at",
    )
    .bind(BOT_CONFIG_NAME)
    .bind(config.enabled)
    .bind(config.welcome_enabled)
    .bind(&config.welcome_text)
    .bind(config.offline_enabled)
    .bind(&config.offline_text)
    .bind(config.pause_when_assigned)
    .bind(config.schedule_enforced)
    .bind(config.timezone_offset_minutes)
    .bind(whitelist)
    .bind(blacklist)
    .bind(rules)
    .bind(schedules)
    .bind(now_iso())
    .execute(pool)
    .await?;
    Ok(())
}

// ---- bot rule fires --------------------------------------------------

pub async fn last_rule_fire(pool: &PgPool, conversation_id: &str, rule_id: &str) -> Option<DateTime<Utc>> {
    let fired_at = sqlx::query_scalar::<_, String>(
        "SELECT fired_at FROM bot_rule_fires WHERE conversation_id = $1 AND rule_id = $2",
    )
    .bind(conversation_id)
    .bind(rule_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()?;
    parse_iso(&fired_at)
}

pub async fn record_rule_fire(pool: &PgPool, conversation_id: &str, rule_id: &str) {
    let _ = sqlx::query(
        "INSERT INTO bot_rule_fires (conversation_id, rule_id, fired_at) VALUES ($1,$2,$3) \
         ON CONFLICT (conversation_id, rule_id) DO UPDATE SET fired_at = EXCLUDED.fired_at",
    )
    .bind(conversation_id)
    .bind(rule_id)
    .bind(now_iso())
    .execute(pool)
    .await;
}

// ---- tickets ---------------------------------------------------------

fn parse_ticket_row(row: PgRow) -> Ticket {
    Ticket {
        id: row.get("id"),
        visitor_session_id: row.get("visitor_session_id"),
        conversation_id: row.get("conversation_id"),
        ip: row.get("ip"),
        user_agent: row.get("user_agent"),
        contact: row.get("contact"),
        body: row.get("body"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn insert_ticket(pool: &PgPool, ticket: &Ticket) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO tickets (id, visitor_session_id, conversation_id, ip, user_agent, contact, \
         body, status, created_at, updated_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
    )
    .bind(&ticket.id)
    .bind(&ticket.visitor_session_id)
    .bind(&ticket.conversation_id)
    .bind(&ticket.ip)
    .bind(&ticket.user_agent)
    .bind(&ticket.contact)
    .bind(&ticket.body)
    .bind(&ticket.status)
    .bind(&ticket.created_at)
    .bind(&ticket.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_tickets(pool: &PgPool, status: Option<&str>) -> Vec<Ticket> {
    let rows = match status {
        Some(status) => sqlx::query(
            "SELECT id, visitor_session_id, conversation_id, ip, user_agent, contact, body, status, \
             created_at, updated_at FROM tickets WHERE status = $1 ORDER BY created_at DESC",
        )
        .bind(status)
        .fetch_all(pool)
        .await,
        None => sqlx::query(
            "SELECT id, visitor_session_id, conversation_id, ip, user_agent, contact, body, status, \
             created_at, updated_at FROM tickets ORDER BY created_at DESC",
        )
        .fetch_all(pool)
        .await,
    }
    .unwrap_or_default();
    rows.into_iter().map(parse_ticket_row).collect()
}

pub async fn close_ticket(pool: &PgPool, id: &str) -> Option<Ticket> {
    let row = sqlx::query(
        "UPDATE tickets SET status = 'closed', updated_at = $1 WHERE id = $2 \
         RETURNING id, visitor_session_id, conversation_id, ip, user_agent, contact, body, status, \
         created_at, updated_at",
    )
    .bind(now_iso())
    .bind(id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()?;
    Some(parse_ticket_row(row))
}

// ---- canned replies --------------------------------------------------

fn parse_canned_row(row: PgRow) -> CannedReply {
    CannedReply {
        id: row.get("id"),
        title: row.get("title"),
        body: row.get("body"),
        active: row.get("active"),
        sort_order: row.get("sort_order"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn list_canned_replies(pool: &PgPool) -> Vec<CannedReply> {
    let rows = sqlx::query(
        "SELECT id, title, body, active, sort_order, created_at, updated_at \
         FROM canned_replies ORDER BY sort_order ASC, created_at ASC",
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    rows.into_iter().map(parse_canned_row).collect()
}

pub async fn insert_canned_reply(pool: &PgPool, reply: &CannedReply) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO canned_replies (id, title, body, active, sort_order, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7)",
    )
    .bind(&reply.id)
    .bind(&reply.title)
    .bind(&reply.body)
    .bind(reply.active)
    .bind(reply.sort_order)
    .bind(&reply.created_at)
    .bind(&reply.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_canned_reply(pool: &PgPool, id: &str) -> Option<CannedReply> {
    let row = sqlx::query(
        "SELECT id, title, body, active, sort_order, created_at, updated_at \
         FROM canned_replies WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()?;
    Some(parse_canned_row(row))
}

pub async fn update_canned_reply(pool: &PgPool, reply: &CannedReply) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE canned_replies SET title = $1, body = $2, active = $3, sort_order = $4, \
         updated_at = $5 WHERE id = $6",
    )
    .bind(&reply.title)
    .bind(&reply.body)
    .bind(reply.active)
    .bind(reply.sort_order)
    .bind(&reply.updated_at)
    .bind(&reply.id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_canned_reply(pool: &PgPool, id: &str) -> bool {
    sqlx::query("DELETE FROM canned_replies WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .map(|r| r.rows_affected() > 0)
        .unwrap_or(false)
}

// ---- tags ------------------------------------------------------------

pub async fn tags_for_conversation(pool: &PgPool, conversation_id: &str) -> Vec<String> {
    sqlx::query_scalar::<_, String>(
        "SELECT tag FROM conversation_tags WHERE conversation_id = $1 ORDER BY tag ASC",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await
    .unwrap_or_default()
}

/// Replacing the full set is the supported write; the primary key keeps
/// each tag unique per conversation.
pub async fn replace_tags(
    pool: &PgPool,
    conversation_id: &str,
    tags: &[String],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM conversation_tags WHERE conversation_id = $1")
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;
    for tag in tags {
        sqlx::query(
            "INSERT INTO conversation_tags (conversation_id, tag, created_at) VALUES ($1,$2,$3) \
             ON CONFLICT (conversation_id, tag) DO NOTHING",
        )
        .bind(conversation_id)
        .bind(tag)
        .bind(now_iso())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn attach_tag(pool: &PgPool, conversation_id: &str, tag: &str) {
    let _ = sqlx::query(
        "INSERT INTO conversation_tags (conversation_id, tag, created_at) VALUES ($1,$2,$3) \
         ON CONFLICT (conversation_id, tag) DO NOTHING",
    )
    .bind(conversation_id)
    .bind(tag)
    .bind(now_iso())
    .execute(pool)
    .await;
}

// ---- notes -----------------------------------------------------------

pub async fn list_notes(pool: &PgPool, conversation_id: &str) -> Vec<Note> {
    let rows = sqlx::query(
        "SELECT id, conversation_id, agent_id, body, created_at FROM notes \
         WHERE conversation_id = $1 ORDER BY created_at ASC",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    rows.into_iter()
        .map(|row| Note {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            agent_id: row.get("agent_id"),
            body: row.get("body"),
            created_at: row.get("created_at"),
        })
        .collect()
}

pub async fn insert_note(pool: &PgPool, note: &Note) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO notes (id, conversation_id, agent_id, body, created_at) VALUES ($1,$2,$3,$4,$5)",
    )
    .bind(&note.id)
    .bind(&note.conversation_id)
    .bind(&note.agent_id)
    .bind(&note.body)
    .bind(&note.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

// ---- ip blocks -------------------------------------------------------

fn parse_ip_block_row(row: PgRow) -> IpBlock {
    IpBlock {
        ip: row.get("ip"),
        reason: row.get("reason"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    }
}

/// An unexpired block for this IP, if one exists.
pub async fn active_ip_block(pool: &PgPool, ip: &str) -> Option<IpBlock> {
    let row = sqlx::query(
        "SELECT ip, reason, expires_at, created_at FROM ip_blocks \
         WHERE ip = $1 AND (expires_at IS NULL OR expires_at > $2)",
    )
    .bind(ip)
    .bind(now_iso())
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()?;
    Some(parse_ip_block_row(row))
}

pub async fn list_ip_blocks(pool: &PgPool) -> Vec<IpBlock> {
    let rows = sqlx::query(
        "SELECT ip, reason, expires_at, created_at FROM ip_blocks ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    rows.into_iter().map(parse_ip_block_row).collect()
}

pub async fn upsert_ip_block(pool: &PgPool, block: &IpBlock) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO ip_blocks (ip, reason, expires_at, created_at) VALUES ($1,$2,$3,$4) \
         ON CONFLICT (ip) DO UPDATE SET reason = EXCLUDED.reason, expires_at = EXCLUDED.expires_at",
    )
    .bind(&block.ip)
    .bind(&block.reason)
    .bind(&block.expires_at)
    .bind(&block.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_ip_block(pool: &PgPool, ip: &str) -> bool {
    sqlx::query("DELETE FROM ip_blocks WHERE ip = $1")
        .bind(ip)
        .execute(pool)
        .await
        .map(|r| r.rows_affected() > 0)
        .unwrap_or(false)
}

// ---- waiting queue ---------------------------------------------------

/// Pure queue math over per-conversation message timestamps, split out
/// so it is testable without a pool.
pub fn queue_entry_from_parts(
    conversation: &Conversation,
    last_visitor_at: Option<DateTime<Utc>>,
    last_agent_at: Option<DateTime<Utc>>,
    first_visitor_at: Option<DateTime<Utc>>,
    first_agent_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> QueueEntry {
    let waiting_seconds = match (last_visitor_at, last_agent_at) {
        (Some(visitor), Some(agent)) if visitor > agent => Some((now - visitor).num_seconds()),
        (Some(visitor), None) => Some((now - visitor).num_seconds()),
        _ => None,
    };
    let first_response_seconds = match (first_visitor_at, first_agent_at) {
        (Some(visitor), Some(agent)) if agent >= visitor => Some((agent - visitor).num_seconds()),
        _ => None,
    };
    QueueEntry {
        conversation_id: conversation.id.clone(),
        visitor_session_id: conversation.visitor_session_id.clone(),
        status: conversation.status.clone(),
        assigned_agent_id: conversation.assigned_agent_id.clone(),
        waiting_seconds,
        first_response_seconds,
    }
}

pub async fn waiting_queue(pool: &PgPool) -> Vec<QueueEntry> {
    let rows = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS}, \
           (SELECT MAX(created_at) FROM messages m WHERE m.conversation_id = conversations.id AND m.sender = 'visitor') AS last_visitor_at, \
           (SELECT MAX(created_at) FROM messages m WHERE m.conversation_id = conversations.id AND m.sender = 'agent') AS last_agent_at, \
           (SELECT MIN(created_at) FROM messages m WHERE m.conversation_id = conversations.id AND m.sender = 'visitor') AS first_visitor_at, \
           (SELECT MIN(created_at) FROM messages m WHERE m.conversation_id = conversations.id AND m.sender = 'agent') AS first_agent_at \
         FROM conversations WHERE status IN ('open','assigned') ORDER BY created_at ASC"
    ))
    .fetch_all(pool)
    .await
    .unwrap_or_default();

    let now = Utc::now();
    rows.into_iter()
        .map(|row| {
            let last_visitor = row
                .get::<Option<String>, _>("last_visitor_at")
                .and_then(|v| parse_iso(&v));
            let last_agent = row
                .get::<Option<String>, _>("last_agent_at")
                .and_then(|v| parse_iso(&v));
            let first_visitor = row
                .get::<Option<String>, _>("first_visitor_at")
                .and_then(|v| parse_iso(&v));
            let first_agent = row
                .get::<Option<String>, _>("first_agent_at")
                .and_then(|v| parse_iso(&v));
            let conversation = parse_conversation_row(row);
            queue_entry_from_parts(
                &conversation,
                last_visitor,
                last_agent,
                first_visitor,
                first_agent,
                now,
            )
        })
        .collect()
}

// ---- search ----------------------------------------------------------

pub async fn search_all(pool: &PgPool, query: &str, limit: i64) -> Value {
    let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));

    let conversation_rows = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations \
         WHERE visitor_session_id ILIKE $1 OR entry_url ILIKE $1 OR referrer ILIKE $1 \
         ORDER BY updated_at DESC LIMIT $2"
    ))
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    let conversations = conversation_rows
        .into_iter()
        .map(parse_conversation_row)
        .collect::<Vec<_>>();

    let message_rows = sqlx::query(
        "SELECT id, conversation_id, sender, agent_id, body, ip, session_id, created_at \
         FROM messages WHERE body ILIKE $1 ORDER BY created_at DESC LIMIT $2",
    )
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    let messages = message_rows
        .into_iter()
        .map(parse_message_row)
        .collect::<Vec<_>>();

    let ticket_rows = sqlx::query(
        "SELECT id, visitor_session_id, conversation_id, ip, user_agent, contact, body, status, \
         created_at, updated_at FROM tickets WHERE body ILIKE $1 OR contact ILIKE $1 \
         ORDER BY created_at DESC LIMIT $2",
    )
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    let tickets = ticket_rows
        .into_iter()
        .map(parse_ticket_row)
        .collect::<Vec<_>>();

    serde_json::json!({
        "conversations": conversations,
        "messages": messages,
        "tickets": tickets,
    })
}

// ---- stats -----------------------------------------------------------

/// Aggregates over a created_at range. One grouped query per entity,
/// averages folded in memory from the per-conversation rows.
pub async fn stats_for_range(pool: &PgPool, from: &str, to: &str) -> Value {
    let conversation_rows = sqlx::query(
        "SELECT c.status, c.created_at, c.closed_at, \
           (SELECT MIN(created_at) FROM messages m WHERE m.conversation_id = c.id AND m.sender = 'visitor') AS first_visitor_at, \
           (SELECT MIN(created_at) FROM messages m WHERE m.conversation_id = c.id AND m.sender = 'agent') AS first_agent_at \
         FROM conversations c WHERE c.created_at >= $1 AND c.created_at <= $2",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await
    .unwrap_or_default();

    let total = conversation_rows.len() as i64;
    let mut closed = 0i64;
    let mut response_samples = Vec::new();
    let mut resolution_samples = Vec::new();
    for row in &conversation_rows {
        let status: String = row.get("status");
        if status == "closed" {
            closed += 1;
        }
        let first_visitor = row
            .get::<Option<String>, _>("first_visitor_at")
            .and_then(|v| parse_iso(&v));
        let first_agent = row
            .get::<Option<String>, _>("first_agent_at")
            .and_then(|v| parse_iso(&v));
        if let (Some(visitor), Some(agent)) = (first_visitor, first_agent) {
            if agent >= visitor {
                response_samples.push((agent - visitor).num_seconds());
            }
        }
        let created = parse_iso(&row.get::<String, _>("created_at"));
        let closed_at = row
            .get::<Option<String>, _>("closed_at")
            .and_then(|v| parse_iso(&v));
        if let (Some(created), Some(closed_at)) = (created, closed_at) {
            resolution_samples.push((closed_at - created).num_seconds());
        }
    }

    let message_row = sqlx::query(
        "SELECT COUNT(1) AS total, \
           COUNT(1) FILTER (WHERE sender = 'visitor') AS visitor, \
           COUNT(1) FILTER (WHERE sender = 'agent') AS agent, \
           COUNT(1) FILTER (WHERE sender = 'system') AS system \
         FROM messages WHERE created_at >= $1 AND created_at <= $2",
    )
    .bind(from)
    .bind(to)
    .fetch_one(pool)
    .await
    .ok();

    let ticket_count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM tickets WHERE created_at >= $1 AND created_at <= $2",
    )
    .bind(from)
    .bind(to)
    .fetch_one(pool)
    .await
    .unwrap_or(0);

    let avg = |samples: &[i64]| -> Option<i64> {
        if samples.is_empty() {
            None
        } else {
            Some(samples.iter().sum::<i64>() / samples.len() as i64)
        }
    };

    serde_json::json!({
        "conversations": { "total": total, "closed": closed },
        "messages": {
            "total": message_row.as_ref().map(|r| r.get::<i64, _>("total")).unwrap_or(0),
            "visitor": message_row.as_ref().map(|r| r.get::<i64, _>("visitor")).unwrap_or(0),
            "agent": message_row.as_ref().map(|r| r.get::<i64, _>("agent")).unwrap_or(0),
            "system": message_row.as_ref().map(|r| r.get::<i64, _>("system")).unwrap_or(0),
        },
        "tickets": { "total": ticket_count },
        "avgFirstResponseSeconds": avg(&response_samples),
        "avgResolutionSeconds": avg(&resolution_samples),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn conversation() -> Conversation {
        Conversation {
            id: "c1".to_string(),
            visitor_session_id: "v1".to_string(),
            visitor_ip: "1.2.3.4".to_string(),
            visitor_user_agent: String::new(),
            entry_url: String::new(),
            referrer: String::new(),
            status: "open".to_string(),
            assigned_agent_id: None,
            created_at: String::new(),
            updated_at: String::new(),
            closed_at: None,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn unanswered_visitor_message_counts_as_waiting() {
        let entry = queue_entry_from_parts(
            &conversation(),
            Some(at(100)),
            None,
            Some(at(100)),
            None,
            at(160),
        );
        assert_eq!(entry.waiting_seconds, Some(60));
        assert_eq!(entry.first_response_seconds, None);
    }

    #[test]
    fn agent_reply_clears_waiting_and_sets_latency() {
        let entry = queue_entry_from_parts(
            &conversation(),
            Some(at(100)),
            Some(at(130)),
            Some(at(100)),
            Some(at(130)),
            at(500),
        );
        assert_eq!(entry.waiting_seconds, None);
        assert_eq!(entry.first_response_seconds, Some(30));
    }

    #[test]
    fn new_visitor_message_after_reply_waits_again() {
        let entry = queue_entry_from_parts(
            &conversation(),
            Some(at(200)),
            Some(at(130)),
            Some(at(100)),
            Some(at(130)),
            at(260),
        );
        assert_eq!(entry.waiting_seconds, Some(60));
        assert_eq!(entry.first_response_seconds, Some(30));
    }

    #[test]
    fn no_messages_means_nothing_to_report() {
        let entry = queue_entry_from_parts(&conversation(), None, None, None, None, at(0));
        assert_eq!(entry.waiting_seconds, None);
        assert_eq!(entry.first_response_seconds, None);
    }
}
