use std::{net::SocketAddr, sync::Arc};

use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::Row;

use crate::types::{AgentProfile, AppState};

pub const AGENT_TOKEN_TTL_SECONDS: i64 = 12 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub role: String,
}

impl AgentIdentity {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

fn token_signature(secret: &str, agent_id: &str, role: &str, exp: i64) -> Option<String> {
    let payload = format!("{agent_id}:{role}:{exp}");
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Stateless bearer token: `agentId.role.expUnix.hexSig`. Agent ids are
/// UUIDs and roles are single words, so `.` is a safe separator.
pub fn issue_agent_token(secret: &str, agent_id: &str, role: &str, ttl_seconds: i64) -> Option<String> {
    let exp = Utc::now().timestamp() + ttl_seconds.max(60);
    let sig = token_signature(secret, agent_id, role, exp)?;
    Some(format!("{agent_id}.{role}.{exp}.{sig}"))
}

pub fn verify_agent_token(secret: &str, token: &str) -> Option<AgentIdentity> {
    let mut parts = token.trim().split('.');
    let agent_id = parts.next()?;
    let role = parts.next()?;
    let exp = parts.next()?.parse::<i64>().ok()?;
    let sig = parts.next()?;
    if parts.next().is_some() || agent_id.is_empty() || role.is_empty() {
        return None;
    }
    if exp < Utc::now().timestamp() {
        return None;
    }
    let signature_bytes = hex::decode(sig).ok()?;
    let payload = format!("{agent_id}:{role}:{exp}");
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload.as_bytes());
    mac.verify_slice(&signature_bytes).ok()?;
    Some(AgentIdentity {
        agent_id: agent_id.to_string(),
        role: role.to_string(),
    })
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

pub fn agent_from_headers(state: &Arc<AppState>, headers: &HeaderMap) -> Option<AgentIdentity> {
    let token = bearer_token(headers)?;
    verify_agent_token(&state.agent_token_secret, &token)
}

/// Caller IP as seen through the reverse proxy: first x-forwarded-for
/// entry, then x-real-ip, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(value) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = value.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    if let Some(value) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

pub async fn verify_agent_login(
    state: &Arc<AppState>,
    email: &str,
    password: &str,
) -> Option<AgentProfile> {
    let row = sqlx::query(
        "SELECT id, name, email, password_hash, role FROM agents WHERE email = $1 LIMIT 1",
    )
    .bind(email.trim().to_lowercase())
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()?;

    let hash: String = row.get("password_hash");
    if !bcrypt::verify(password, &hash).unwrap_or(false) {
        return None;
    }
    Some(AgentProfile {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        role: row.get("role"),
    })
}

pub async fn agent_profile_by_id(state: &Arc<AppState>, agent_id: &str) -> Option<AgentProfile> {
    let row = sqlx::query("SELECT id, name, email, role FROM agents WHERE id = $1")
        .bind(agent_id)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten()?;
    Some(AgentProfile {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        role: row.get("role"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "test-secret";

    #[test]
    fn token_round_trip() {
        let token = issue_agent_token(SECRET, "agent-1", "agent", 3600).unwrap();
        let identity = verify_agent_token(SECRET, &token).unwrap();
        assert_eq!(identity.agent_id, "agent-1");
        assert_eq!(identity.role, "agent");
        assert!(!identity.is_admin());
    }

    #[test]
    fn admin_role_flag() {
        let token = issue_agent_token(SECRET, "agent-2", "admin", 3600).unwrap();
        assert!(verify_agent_token(SECRET, &token).unwrap().is_admin());
    }

    #[test]
    fn expired_token_rejected() {
        // ttl is clamped to 60s minimum, so build an expired one by hand.
        let exp = Utc::now().timestamp() - 10;
        let sig = token_signature(SECRET, "agent-1", "agent", exp).unwrap();
        let token = format!("agent-1.agent.{exp}.{sig}");
        assert!(verify_agent_token(SECRET, &token).is_none());
    }

    #[test]
    fn tampered_token_rejected() {
        let token = issue_agent_token(SECRET, "agent-1", "agent", 3600).unwrap();
        let escalated = token.replacen(".agent.", ".admin.", 1);
        assert!(verify_agent_token(SECRET, &escalated).is_none());
        assert!(verify_agent_token("other-secret", &token).is_none());
    }

    #[test]
    fn malformed_tokens_rejected() {
        assert!(verify_agent_token(SECRET, "").is_none());
        assert!(verify_agent_token(SECRET, "a.b").is_none());
        assert!(verify_agent_token(SECRET, "a.b.notanumber.ff").is_none());
        assert!(verify_agent_token(SECRET, "a.b.1.zz.extra").is_none());
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer  abc "));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.9");

        headers.remove("x-forwarded-for");
        assert_eq!(client_ip(&headers, Some(peer)), "10.0.0.2");

        headers.remove("x-real-ip");
        assert_eq!(client_ip(&headers, Some(peer)), "127.0.0.1");
        assert_eq!(client_ip(&headers, None), "");
    }
}
