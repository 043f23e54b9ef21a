use std::{
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    auth::{self, AgentIdentity},
    bot, guard,
    sanitize::{self, MAX_MESSAGE_BODY, MAX_URL},
    store,
    types::{
        AdminAuthData, AdminConversationData, AdminMessageData, AppState, ChatMessage,
        Conversation, ErrorCode, EventEnvelopeIn, RealtimeState, VisitorHelloData,
        VisitorMessageData,
    },
};

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

pub async fn emit_to_client<T: Serialize>(
    state: &Arc<AppState>,
    client_id: usize,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };
    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };
    if let Some(sender) = tx {
        let _ = sender.send(payload);
    }
}

pub async fn emit_to_clients<T: Serialize>(
    state: &Arc<AppState>,
    client_ids: &[usize],
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };
    let senders = {
        let rt = state.realtime.lock().await;
        client_ids
            .iter()
            .filter_map(|id| rt.clients.get(id).cloned())
            .collect::<Vec<_>>()
    };
    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

async fn emit_error(state: &Arc<AppState>, client_id: usize, code: ErrorCode) {
    emit_to_client(state, client_id, "error", json!({ "error": code })).await;
}

/// Everyone in the conversation: its visitor room plus its agent room.
async fn conversation_recipients(state: &Arc<AppState>, conversation_id: &str) -> Vec<usize> {
    let rt = state.realtime.lock().await;
    let mut ids = Vec::new();
    if let Some(room) = rt.visitor_rooms.get(conversation_id) {
        ids.extend(room.iter().copied());
    }
    if let Some(room) = rt.agent_rooms.get(conversation_id) {
        for id in room {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
    }
    ids
}

async fn all_agent_clients(state: &Arc<AppState>) -> Vec<usize> {
    let rt = state.realtime.lock().await;
    rt.agents.iter().copied().collect()
}

pub async fn broadcast_to_conversation<T: Serialize>(
    state: &Arc<AppState>,
    conversation_id: &str,
    event: &str,
    data: T,
) {
    let recipients = conversation_recipients(state, conversation_id).await;
    emit_to_clients(state, &recipients, event, data).await;
}

fn conversation_update_payload(conversation: &Conversation) -> serde_json::Value {
    json!({
        "conversationId": conversation.id,
        "status": conversation.status,
        "assignedTo": conversation.assigned_agent_id,
        "updatedAt": conversation.updated_at,
    })
}

/// `conversation_update` fan-out: every authenticated agent connection
/// (dashboards are not room-scoped) plus the conversation's visitor room.
async fn emit_conversation_update(state: &Arc<AppState>, conversation: &Conversation) {
    let payload = conversation_update_payload(conversation);
    let agents = all_agent_clients(state).await;
    emit_to_clients(state, &agents, "conversation_update", payload.clone()).await;
    let visitors = {
        let rt = state.realtime.lock().await;
        rt.visitor_rooms
            .get(&conversation.id)
            .map(|room| room.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default()
    };
    emit_to_clients(state, &visitors, "conversation_update", payload).await;
}

async fn send_open_and_history(state: &Arc<AppState>, client_id: usize, conversation: &Conversation) {
    emit_to_client(
        state,
        client_id,
        "conversation_open",
        json!({ "conversationId": conversation.id, "status": conversation.status }),
    )
    .await;
    let history = store::conversation_history(&state.db, &conversation.id, store::HISTORY_LIMIT).await;
    emit_to_client(state, client_id, "message_history", history).await;
}

// ---- visitor channel -------------------------------------------------

pub async fn visitor_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let ip = auth::client_ip(&headers, Some(peer));
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    ws.on_upgrade(move |socket| handle_visitor_socket(socket, state, ip, user_agent))
}

async fn register_client(state: &Arc<AppState>) -> (usize, mpsc::UnboundedReceiver<String>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let mut rt = state.realtime.lock().await;
    rt.clients.insert(client_id, tx);
    (client_id, rx)
}

async fn unregister_client(state: &Arc<AppState>, client_id: usize) {
    let mut rt = state.realtime.lock().await;
    rt.clients.remove(&client_id);
    rt.agents.remove(&client_id);
    rt.visitor_conversation.remove(&client_id);
    for room in rt.visitor_rooms.values_mut() {
        room.remove(&client_id);
    }
    for room in rt.agent_rooms.values_mut() {
        room.remove(&client_id);
    }
    rt.visitor_rooms.retain(|_, room| !room.is_empty());
    rt.agent_rooms.retain(|_, room| !room.is_empty());
}

async fn handle_visitor_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    ip: String,
    user_agent: String,
) {
    let (client_id, mut rx) = register_client(&state).await;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // Block list and connection flood checks gate the whole channel.
    let mut rejected = false;
    if let Some(block) = store::active_ip_block(&state.db, &ip).await {
        store::record_event(
            &state.db,
            "visitor",
            None,
            "IP_BLOCKED",
            &ip,
            None,
            None,
            json!({ "reason": block.reason }),
        )
        .await;
        emit_error(&state, client_id, ErrorCode::IpBlocked).await;
        rejected = true;
    } else if !state
        .limiter
        .allow(
            &format!("connect:{ip}"),
            guard::VISITOR_CONNECT_LIMIT,
            guard::VISITOR_CONNECT_WINDOW_MS,
        )
        .ok
    {
        emit_error(&state, client_id, ErrorCode::RateLimited).await;
        rejected = true;
    }

    if !rejected {
        while let Some(Ok(message)) = ws_receiver.next().await {
            let text = match message {
                Message::Text(text) => text.to_string(),
                Message::Close(_) => break,
                _ => continue,
            };
            let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
                emit_error(&state, client_id, ErrorCode::InvalidInput).await;
                continue;
            };
            handle_visitor_event(&state, client_id, &ip, &user_agent, envelope).await;
        }
    }

    // Dropping the registered sender ends the writer loop after it has
    // flushed anything still queued.
    unregister_client(&state, client_id).await;
    let _ = send_task.await;
}

async fn handle_visitor_event(
    state: &Arc<AppState>,
    client_id: usize,
    ip: &str,
    user_agent: &str,
    envelope: EventEnvelopeIn,
) {
    match envelope.event.as_str() {
        "visitor_hello" => {
            let Ok(data) = serde_json::from_value::<VisitorHelloData>(envelope.data) else {
                emit_error(state, client_id, ErrorCode::InvalidInput).await;
                return;
            };
            visitor_hello(state, client_id, ip, user_agent, data).await;
        }
        "visitor_message" => {
            let Ok(data) = serde_json::from_value::<VisitorMessageData>(envelope.data) else {
                emit_error(state, client_id, ErrorCode::InvalidInput).await;
                return;
            };
            visitor_message(state, client_id, ip, data).await;
        }
        other => {
            store::record_event(
                &state.db,
                "visitor",
                None,
                "INVALID_EVENT",
                ip,
                None,
                None,
                json!({ "event": other, "channel": "visitor" }),
            )
            .await;
            emit_error(state, client_id, ErrorCode::InvalidEvent).await;
        }
    }
}

async fn visitor_hello(
    state: &Arc<AppState>,
    client_id: usize,
    ip: &str,
    user_agent: &str,
    data: VisitorHelloData,
) {
    if !sanitize::valid_session_id(&data.session_id) {
        emit_error(state, client_id, ErrorCode::InvalidInput).await;
        return;
    }
    // Repeated hellos with fresh session ids would otherwise mint
    // conversation rows without tripping the connect guard.
    if !state
        .limiter
        .allow(
            &format!("hello:{ip}"),
            guard::VISITOR_HELLO_LIMIT,
            guard::VISITOR_HELLO_WINDOW_MS,
        )
        .ok
    {
        emit_error(state, client_id, ErrorCode::RateLimited).await;
        return;
    }
    let session_id = data.session_id;
    let entry_url = sanitize::clean_line(&data.entry_url, MAX_URL);
    let referrer = sanitize::clean_line(&data.referrer, MAX_URL);

    // A returning session re-attaches to its live conversation; a new
    // one gets a fresh row.
    let mut created = false;
    let conversation = match store::find_live_conversation(&state.db, &session_id).await {
        Some(existing) => existing,
        None => {
            let now = store::now_iso();
            let conversation = Conversation {
                id: Uuid::new_v4().to_string(),
                visitor_session_id: session_id.clone(),
                visitor_ip: ip.to_string(),
                visitor_user_agent: sanitize::clean_line(user_agent, MAX_URL),
                entry_url,
                referrer,
                status: "open".to_string(),
                assigned_agent_id: None,
                created_at: now.clone(),
                updated_at: now,
                closed_at: None,
            };
            if let Err(err) = store::insert_conversation(&state.db, &conversation).await {
                tracing::error!(session_id = %session_id, error = %err, "conversation create failed");
                emit_error(state, client_id, ErrorCode::ServerError).await;
                return;
            }
            created = true;
            store::record_event(
                &state.db,
                "visitor",
                None,
                "CONVERSATION_OPENED",
                ip,
                Some(session_id.as_str()),
                Some(conversation.id.as_str()),
                json!({ "entryUrl": conversation.entry_url, "referrer": conversation.referrer }),
            )
            .await;
            conversation
        }
    };

    {
        let mut rt = state.realtime.lock().await;
        rt.visitor_rooms
            .entry(conversation.id.clone())
            .or_default()
            .insert(client_id);
        rt.visitor_conversation
            .insert(client_id, conversation.id.clone());
    }

    send_open_and_history(state, client_id, &conversation).await;

    // Welcome only on the session's very first contact ever.
    if created && store::session_conversation_count(&state.db, &session_id).await == 1 {
        bot::send_welcome(state, &conversation).await;
    }

    let agents = all_agent_clients(state).await;
    emit_to_clients(
        state,
        &agents,
        "conversation_update",
        conversation_update_payload(&conversation),
    )
    .await;
}

/// A visitor connection may only write into the conversation it bound
/// with `visitor_hello`.
fn is_bound_to(rt: &RealtimeState, client_id: usize, conversation_id: &str) -> bool {
    rt.visitor_conversation
        .get(&client_id)
        .is_some_and(|bound| bound == conversation_id)
}

async fn visitor_message(
    state: &Arc<AppState>,
    client_id: usize,
    ip: &str,
    data: VisitorMessageData,
) {
    {
        let rt = state.realtime.lock().await;
        if !is_bound_to(&rt, client_id, &data.conversation_id) {
            drop(rt);
            emit_error(state, client_id, ErrorCode::ConversationNotFound).await;
            return;
        }
    }

    let decision = state.limiter.allow(
        ip,
        guard::VISITOR_MESSAGE_LIMIT,
        guard::VISITOR_MESSAGE_WINDOW_MS,
    );
    if !decision.ok {
        emit_error(state, client_id, ErrorCode::RateLimited).await;
        return;
    }
    if !state
        .limiter
        .cooldown(ip, guard::VISITOR_MESSAGE_COOLDOWN_MS)
    {
        emit_error(state, client_id, ErrorCode::Cooldown).await;
        return;
    }

    let body = sanitize::clean_text(&data.body_text, MAX_MESSAGE_BODY);
    if body.is_empty() {
        // Whitespace-only submissions are dropped without an error.
        return;
    }

    let conversation = match store::get_conversation(&state.db, &data.conversation_id).await {
        Some(conversation) if !conversation.is_closed() => conversation,
        _ => {
            emit_error(state, client_id, ErrorCode::ConversationNotFound).await;
            return;
        }
    };

    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation.id.clone(),
        sender: "visitor".to_string(),
        agent_id: None,
        body: body.clone(),
        ip: ip.to_string(),
        session_id: conversation.visitor_session_id.clone(),
        created_at: store::now_iso(),
    };
    if let Err(err) = store::insert_message(&state.db, &message).await {
        tracing::error!(conversation_id = %conversation.id, error = %err, "visitor message persist failed");
        emit_error(state, client_id, ErrorCode::ServerError).await;
        return;
    }
    store::touch_conversation(&state.db, &conversation.id).await;
    store::record_event(
        &state.db,
        "visitor",
        None,
        "VISITOR_MESSAGE",
        ip,
        Some(conversation.visitor_session_id.as_str()),
        Some(conversation.id.as_str()),
        json!({ "messageId": message.id }),
    )
    .await;

    broadcast_to_conversation(state, &conversation.id, "message_new", &message).await;

    // The bot runs after the broadcast and never blocks it.
    tokio::spawn(bot::run_for_visitor_message(state.clone(), conversation, body));
}

// ---- agent channel ---------------------------------------------------

pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let ip = auth::client_ip(&headers, Some(peer));
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state, ip))
}

async fn handle_agent_socket(socket: WebSocket, state: Arc<AppState>, ip: String) {
    let (client_id, mut rx) = register_client(&state).await;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // Identity lives for the connection once admin_auth succeeds.
    let mut identity: Option<AgentIdentity> = None;

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            emit_error(&state, client_id, ErrorCode::InvalidInput).await;
            continue;
        };
        handle_agent_event(&state, client_id, &ip, &mut identity, envelope).await;
    }

    unregister_client(&state, client_id).await;
    let _ = send_task.await;
}

async fn handle_agent_event(
    state: &Arc<AppState>,
    client_id: usize,
    ip: &str,
    identity: &mut Option<AgentIdentity>,
    envelope: EventEnvelopeIn,
) {
    match envelope.event.as_str() {
        "admin_auth" => {
            let Ok(data) = serde_json::from_value::<AdminAuthData>(envelope.data) else {
                emit_error(state, client_id, ErrorCode::InvalidInput).await;
                return;
            };
            admin_auth(state, client_id, ip, identity, data).await;
        }
        "admin_join" => {
            let Some(agent) = identity.clone() else {
                emit_error(state, client_id, ErrorCode::Unauthorized).await;
                return;
            };
            let Ok(data) = serde_json::from_value::<AdminConversationData>(envelope.data) else {
                emit_error(state, client_id, ErrorCode::InvalidInput).await;
                return;
            };
            admin_join(state, client_id, &agent, data).await;
        }
        "admin_assign" => {
            let Some(agent) = identity.clone() else {
                emit_error(state, client_id, ErrorCode::Unauthorized).await;
                return;
            };
            let Ok(data) = serde_json::from_value::<AdminConversationData>(envelope.data) else {
                emit_error(state, client_id, ErrorCode::InvalidInput).await;
                return;
            };
            admin_assign(state, client_id, ip, &agent, data).await;
        }
        "admin_message" => {
            let Some(agent) = identity.clone() else {
                emit_error(state, client_id, ErrorCode::Unauthorized).await;
                return;
            };
            let Ok(data) = serde_json::from_value::<AdminMessageData>(envelope.data) else {
                emit_error(state, client_id, ErrorCode::InvalidInput).await;
                return;
            };
            admin_message(state, client_id, ip, &agent, data).await;
        }
        "admin_close" => {
            let Some(agent) = identity.clone() else {
                emit_error(state, client_id, ErrorCode::Unauthorized).await;
                return;
            };
            let Ok(data) = serde_json::from_value::<AdminConversationData>(envelope.data) else {
                emit_error(state, client_id, ErrorCode::InvalidInput).await;
                return;
            };
            admin_close(state, client_id, ip, &agent, data).await;
        }
        other => {
            store::record_event(
                &state.db,
                "agent",
                identity.as_ref().map(|a| a.agent_id.as_str()),
                "INVALID_EVENT",
                ip,
                None,
                None,
                json!({ "event": other, "channel": "agent" }),
            )
            .await;
            emit_error(state, client_id, ErrorCode::InvalidEvent).await;
        }
    }
}

async fn admin_auth(
    state: &Arc<AppState>,
    client_id: usize,
    ip: &str,
    identity: &mut Option<AgentIdentity>,
    data: AdminAuthData,
) {
    let Some(verified) = auth::verify_agent_token(&state.agent_token_secret, &data.token) else {
        store::record_event(
            &state.db,
            "agent",
            None,
            "AGENT_AUTH_FAILED",
            ip,
            None,
            None,
            json!({ "channel": "agent" }),
        )
        .await;
        emit_error(state, client_id, ErrorCode::Unauthorized).await;
        return;
    };

    {
        let mut rt = state.realtime.lock().await;
        rt.agents.insert(client_id);
    }
    emit_to_client(
        state,
        client_id,
        "admin_authed",
        json!({ "ok": true, "adminId": verified.agent_id, "role": verified.role }),
    )
    .await;
    *identity = Some(verified);
}

async fn admin_join(
    state: &Arc<AppState>,
    client_id: usize,
    _agent: &AgentIdentity,
    data: AdminConversationData,
) {
    let Some(conversation) = store::get_conversation(&state.db, &data.conversation_id).await else {
        emit_error(state, client_id, ErrorCode::ConversationNotFound).await;
        return;
    };
    {
        let mut rt = state.realtime.lock().await;
        rt.agent_rooms
            .entry(conversation.id.clone())
            .or_default()
            .insert(client_id);
    }
    send_open_and_history(state, client_id, &conversation).await;
}

async fn admin_assign(
    state: &Arc<AppState>,
    client_id: usize,
    ip: &str,
    agent: &AgentIdentity,
    data: AdminConversationData,
) {
    let Some(conversation) =
        store::assign_conversation(&state.db, &data.conversation_id, &agent.agent_id).await
    else {
        emit_error(state, client_id, ErrorCode::ConversationNotFound).await;
        return;
    };
    store::record_event(
        &state.db,
        "agent",
        Some(agent.agent_id.as_str()),
        "CONVERSATION_ASSIGNED",
        ip,
        Some(conversation.visitor_session_id.as_str()),
        Some(conversation.id.as_str()),
        json!({ "assignedTo": agent.agent_id }),
    )
    .await;
    emit_conversation_update(state, &conversation).await;
}

async fn admin_message(
    state: &Arc<AppState>,
    client_id: usize,
    ip: &str,
    agent: &AgentIdentity,
    data: AdminMessageData,
) {
    let key = guard::agent_message_key(ip, &agent.agent_id);
    if !state
        .limiter
        .allow(&key, guard::AGENT_MESSAGE_LIMIT, guard::AGENT_MESSAGE_WINDOW_MS)
        .ok
    {
        emit_error(state, client_id, ErrorCode::RateLimited).await;
        return;
    }

    let body = sanitize::clean_text(&data.body_text, MAX_MESSAGE_BODY);
    if body.is_empty() {
        return;
    }

    let conversation = match store::get_conversation(&state.db, &data.conversation_id).await {
        Some(conversation) if !conversation.is_closed() => conversation,
        _ => {
            emit_error(state, client_id, ErrorCode::ConversationNotFound).await;
            return;
        }
    };

    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation.id.clone(),
        sender: "agent".to_string(),
        agent_id: Some(agent.agent_id.clone()),
        body,
        ip: ip.to_string(),
        session_id: conversation.visitor_session_id.clone(),
        created_at: store::now_iso(),
    };
    if let Err(err) = store::insert_message(&state.db, &message).await {
        tracing::error!(conversation_id = %conversation.id, error = %err, "agent message persist failed");
        emit_error(state, client_id, ErrorCode::ServerError).await;
        return;
    }
    store::touch_conversation(&state.db, &conversation.id).await;
    store::record_event(
        &state.db,
        "agent",
        Some(agent.agent_id.as_str()),
        "AGENT_MESSAGE",
        ip,
        Some(conversation.visitor_session_id.as_str()),
        Some(conversation.id.as_str()),
        json!({ "messageId": message.id }),
    )
    .await;

    broadcast_to_conversation(state, &conversation.id, "message_new", &message).await;
}

async fn admin_close(
    state: &Arc<AppState>,
    client_id: usize,
    ip: &str,
    agent: &AgentIdentity,
    data: AdminConversationData,
) {
    let Some(conversation) = store::close_conversation(&state.db, &data.conversation_id).await
    else {
        emit_error(state, client_id, ErrorCode::ConversationNotFound).await;
        return;
    };
    store::record_event(
        &state.db,
        "agent",
        Some(agent.agent_id.as_str()),
        "CONVERSATION_CLOSED",
        ip,
        Some(conversation.visitor_session_id.as_str()),
        Some(conversation.id.as_str()),
        json!({}),
    )
    .await;
    emit_conversation_update(state, &conversation).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visitor_must_bind_before_messaging() {
        let mut rt = RealtimeState::default();
        assert!(!is_bound_to(&rt, 1, "c1"));

        rt.visitor_conversation.insert(1, "c1".to_string());
        assert!(is_bound_to(&rt, 1, "c1"));
        // A different conversation, or a different connection, stays out.
        assert!(!is_bound_to(&rt, 1, "c2"));
        assert!(!is_bound_to(&rt, 2, "c1"));
    }

    #[test]
    fn unbinding_follows_unregister() {
        let mut rt = RealtimeState::default();
        rt.visitor_conversation.insert(7, "c1".to_string());
        rt.visitor_conversation.remove(&7);
        assert!(!is_bound_to(&rt, 7, "c1"));
    }
}
