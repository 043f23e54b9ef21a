use std::{
    collections::{HashMap, HashSet},
    sync::{atomic::AtomicUsize, Arc},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};

use crate::guard::{BotConfigCache, RateLimiter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub visitor_session_id: String,
    pub visitor_ip: String,
    pub visitor_user_agent: String,
    pub entry_url: String,
    pub referrer: String,
    pub status: String,
    pub assigned_agent_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub closed_at: Option<String>,
}

impl Conversation {
    pub fn is_closed(&self) -> bool {
        self.status == "closed"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub body: String,
    #[serde(skip_serializing, default)]
    pub ip: String,
    #[serde(skip_serializing, default)]
    pub session_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    pub visitor_session_id: String,
    pub conversation_id: Option<String>,
    pub ip: String,
    pub user_agent: String,
    pub contact: String,
    pub body: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CannedReply {
    pub id: String,
    pub title: String,
    pub body: String,
    pub active: bool,
    pub sort_order: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub reply: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_match_mode")]
    pub match_mode: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub cooldown_seconds: i64,
    #[serde(default)]
    pub auto_tag: String,
    #[serde(default)]
    pub create_ticket: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotSchedule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub weekdays: Vec<u8>,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    pub enabled: bool,
    pub welcome_enabled: bool,
    pub welcome_text: String,
    pub offline_enabled: bool,
    pub offline_text: String,
    pub pause_when_assigned: bool,
    pub schedule_enforced: bool,
    pub timezone_offset_minutes: i64,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub rules: Vec<BotRule>,
    pub schedules: Vec<BotSchedule>,
    pub updated_at: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            welcome_enabled: false,
            welcome_text: String::new(),
            offline_enabled: false,
            offline_text: String::new(),
            pause_when_assigned: true,
            schedule_enforced: false,
            timezone_offset_minutes: 0,
            whitelist: vec![],
            blacklist: vec![],
            rules: vec![],
            schedules: vec![],
            updated_at: String::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_match_mode() -> String {
    "contains".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub conversation_id: String,
    pub agent_id: String,
    pub body: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    pub actor_kind: String,
    pub actor_id: Option<String>,
    pub action: String,
    pub ip: String,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub detail: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpBlock {
    pub ip: String,
    pub reason: String,
    pub expires_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub conversation_id: String,
    pub visitor_session_id: String,
    pub status: String,
    pub assigned_agent_id: Option<String>,
    pub waiting_seconds: Option<i64>,
    pub first_response_seconds: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidInput,
    InvalidEvent,
    Unauthorized,
    Forbidden,
    RateLimited,
    Cooldown,
    IpBlocked,
    ConversationNotFound,
    ServerError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::InvalidEvent => "INVALID_EVENT",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Cooldown => "COOLDOWN",
            ErrorCode::IpBlocked => "IP_BLOCKED",
            ErrorCode::ConversationNotFound => "CONVERSATION_NOT_FOUND",
            ErrorCode::ServerError => "SERVER_ERROR",
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Connection registry for both realtime channels.
#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    /// Every authenticated agent connection, room-joined or not.
    pub agents: HashSet<usize>,
    pub visitor_rooms: HashMap<String, HashSet<usize>>,
    pub agent_rooms: HashMap<String, HashSet<usize>>,
    /// Which conversation each visitor connection bound via hello;
    /// visitor messages are only accepted for that conversation.
    pub visitor_conversation: HashMap<usize, String>,
}

pub struct AppState {
    pub db: PgPool,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
    pub limiter: Arc<dyn RateLimiter>,
    pub bot_cache: Arc<dyn BotConfigCache>,
    pub agent_token_secret: String,
    pub internal_secret: String,
    pub public_base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorHelloData {
    pub session_id: String,
    #[serde(default)]
    pub entry_url: String,
    #[serde(default)]
    pub referrer: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorMessageData {
    pub conversation_id: String,
    pub body_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminAuthData {
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConversationData {
    pub conversation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminMessageData {
    pub conversation_id: String,
    pub body_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCannedReplyBody {
    pub title: String,
    pub body: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub sort_order: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCannedReplyBody {
    pub title: Option<String>,
    pub body: Option<String>,
    pub active: Option<bool>,
    pub sort_order: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutBotConfigBody {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub welcome_enabled: bool,
    #[serde(default)]
    pub welcome_text: String,
    #[serde(default)]
    pub offline_enabled: bool,
    #[serde(default)]
    pub offline_text: String,
    #[serde(default = "default_true")]
    pub pause_when_assigned: bool,
    #[serde(default)]
    pub schedule_enforced: bool,
    #[serde(default)]
    pub timezone_offset_minutes: i64,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub rules: Vec<BotRule>,
    #[serde(default)]
    pub schedules: Vec<BotSchedule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTagsBody {
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNoteBody {
    pub body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTicketBody {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub contact: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIpBlockBody {
    pub ip: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_closed_status_is_terminal() {
        let mut conversation = Conversation {
            id: "c1".to_string(),
            visitor_session_id: "v1".to_string(),
            visitor_ip: String::new(),
            visitor_user_agent: String::new(),
            entry_url: String::new(),
            referrer: String::new(),
            status: "open".to_string(),
            assigned_agent_id: None,
            created_at: String::new(),
            updated_at: String::new(),
            closed_at: None,
        };
        assert!(!conversation.is_closed());
        conversation.status = "assigned".to_string();
        assert!(!conversation.is_closed());
        conversation.status = "closed".to_string();
        assert!(conversation.is_closed());
    }
}
