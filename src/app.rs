use std::{net::SocketAddr, sync::{atomic::AtomicUsize, Arc}};

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::{
    auth::{self, AgentIdentity, AGENT_TOKEN_TTL_SECONDS},
    bot, guard,
    guard::{MemoryBotConfigCache, MemoryRateLimiter},
    realtime, sanitize, store,
    types::{
        AppState, CannedReply, CreateCannedReplyBody, CreateIpBlockBody, CreateNoteBody,
        CreateTicketBody, ErrorCode, IpBlock, LoginBody, Note, PutBotConfigBody, RealtimeState,
        SearchQuery, SetTagsBody, StatsQuery, Ticket, UpdateCannedReplyBody,
    },
};

fn err(status: StatusCode, code: ErrorCode) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "ok": false, "error": code })))
}

fn ok<T: serde::Serialize>(key: &str, payload: T) -> Json<Value> {
    Json(json!({ "ok": true, key: payload }))
}

fn require_agent(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<AgentIdentity, (StatusCode, Json<Value>)> {
    auth::agent_from_headers(state, headers)
        .ok_or_else(|| err(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized))
}

fn require_admin(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<AgentIdentity, (StatusCode, Json<Value>)> {
    let agent = require_agent(state, headers)?;
    if !agent.is_admin() {
        return Err(err(StatusCode::FORBIDDEN, ErrorCode::Forbidden));
    }
    Ok(agent)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": store::now_iso() }))
}

// ---- auth ------------------------------------------------------------

async fn login_agent(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<LoginBody>,
) -> impl IntoResponse {
    let ip = auth::client_ip(&headers, Some(peer));
    let Some(profile) = auth::verify_agent_login(&state, &body.email, &body.password).await else {
        store::record_event(
            &state.db,
            "agent",
            None,
            "AGENT_AUTH_FAILED",
            &ip,
            None,
            None,
            json!({ "channel": "rest" }),
        )
        .await;
        return err(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized).into_response();
    };

    let Some(token) = auth::issue_agent_token(
        &state.agent_token_secret,
        &profile.id,
        &profile.role,
        AGENT_TOKEN_TTL_SECONDS,
    ) else {
        return err(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::ServerError).into_response();
    };

    Json(json!({ "ok": true, "token": token, "agent": profile })).into_response()
}

async fn get_me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let agent = match require_agent(&state, &headers) {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    match auth::agent_profile_by_id(&state, &agent.agent_id).await {
        Some(profile) => ok("agent", profile).into_response(),
        None => err(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized).into_response(),
    }
}

// ---- canned replies --------------------------------------------------

async fn get_canned_replies(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(resp) = require_agent(&state, &headers) {
        return resp.into_response();
    }
    ok("cannedReplies", store::list_canned_replies(&state.db).await).into_response()
}

async fn create_canned_reply(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateCannedReplyBody>,
) -> impl IntoResponse {
    let agent = match require_agent(&state, &headers) {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };

    let title = sanitize::clean_line(&body.title, sanitize::MAX_CANNED_TITLE);
    let reply_body = sanitize::clean_text(&body.body, sanitize::MAX_CANNED_BODY);
    if title.is_empty() || reply_body.is_empty() {
        return err(StatusCode::BAD_REQUEST, ErrorCode::InvalidInput).into_response();
    }

    let now = store::now_iso();
    let reply = CannedReply {
        id: Uuid::new_v4().to_string(),
        title,
        body: reply_body,
        active: body.active,
        sort_order: body.sort_order,
        created_at: now.clone(),
        updated_at: now,
    };
    if store::insert_canned_reply(&state.db, &reply).await.is_err() {
        return err(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::ServerError).into_response();
    }
    store::record_event(
        &state.db,
        "agent",
        Some(agent.agent_id.as_str()),
        "CANNED_REPLY_CREATED",
        "",
        None,
        None,
        json!({ "cannedReplyId": reply.id }),
    )
    .await;
    (StatusCode::CREATED, ok("cannedReply", reply)).into_response()
}

async fn update_canned_reply(
    Path(canned_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateCannedReplyBody>,
) -> impl IntoResponse {
    let agent = match require_agent(&state, &headers) {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    let Some(mut reply) = store::get_canned_reply(&state.db, &canned_id).await else {
        return err(StatusCode::NOT_FOUND, ErrorCode::InvalidInput).into_response();
    };

    if let Some(title) = body.title {
        let title = sanitize::clean_line(&title, sanitize::MAX_CANNED_TITLE);
        if title.is_empty() {
            return err(StatusCode::BAD_REQUEST, ErrorCode::InvalidInput).into_response();
        }
        reply.title = title;
    }
    if let Some(text) = body.body {
        let text = sanitize::clean_text(&text, sanitize::MAX_CANNED_BODY);
        if text.is_empty() {
            return err(StatusCode::BAD_REQUEST, ErrorCode::InvalidInput).into_response();
        }
        reply.body = text;
    }
    if let Some(active) = body.active {
        reply.active = active;
    }
    if let Some(sort_order) = body.sort_order {
        reply.sort_order = sort_order;
    }
    reply.updated_at = store::now_iso();

    if store::update_canned_reply(&state.db, &reply).await.is_err() {
        return err(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::ServerError).into_response();
    }
    store::record_event(
        &state.db,
        "agent",
        Some(agent.agent_id.as_str()),
        "CANNED_REPLY_UPDATED",
        "",
        None,
        None,
        json!({ "cannedReplyId": reply.id }),
    )
    .await;
    ok("cannedReply", reply).into_response()
}

async fn remove_canned_reply(
    Path(canned_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let agent = match require_agent(&state, &headers) {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    if !store::delete_canned_reply(&state.db, &canned_id).await {
        return err(StatusCode::NOT_FOUND, ErrorCode::InvalidInput).into_response();
    }
    store::record_event(
        &state.db,
        "agent",
        Some(agent.agent_id.as_str()),
        "CANNED_REPLY_DELETED",
        "",
        None,
        None,
        json!({ "cannedReplyId": canned_id }),
    )
    .await;
    Json(json!({ "ok": true })).into_response()
}

// ---- bot config ------------------------------------------------------

async fn get_bot_config(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(resp) = require_agent(&state, &headers) {
        return resp.into_response();
    }
    ok("config", bot::cached_bot_config(&state).await).into_response()
}

async fn put_bot_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PutBotConfigBody>,
) -> impl IntoResponse {
    let agent = match require_admin(&state, &headers) {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };

    let config = bot::normalize_config(body);
    if store::save_bot_config(&state.db, &config).await.is_err() {
        return err(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::ServerError).into_response();
    }
    state.bot_cache.invalidate();
    store::record_event(
        &state.db,
        "agent",
        Some(agent.agent_id.as_str()),
        "BOT_CONFIG_UPDATED",
        "",
        None,
        None,
        json!({ "rules": config.rules.len(), "schedules": config.schedules.len() }),
    )
    .await;
    ok("config", config).into_response()
}

async fn get_bot_events(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(resp) = require_agent(&state, &headers) {
        return resp.into_response();
    }
    let events = store::recent_events_by_action(&state.db, bot::BOT_AUDIT_ACTION, 100).await;
    ok("events", events).into_response()
}

// ---- tags / notes ----------------------------------------------------

async fn get_conversation_tags(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(resp) = require_agent(&state, &headers) {
        return resp.into_response();
    }
    if store::get_conversation(&state.db, &conversation_id).await.is_none() {
        return err(StatusCode::NOT_FOUND, ErrorCode::ConversationNotFound).into_response();
    }
    ok("tags", store::tags_for_conversation(&state.db, &conversation_id).await).into_response()
}

async fn put_conversation_tags(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SetTagsBody>,
) -> impl IntoResponse {
    let agent = match require_agent(&state, &headers) {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    if store::get_conversation(&state.db, &conversation_id).await.is_none() {
        return err(StatusCode::NOT_FOUND, ErrorCode::ConversationNotFound).into_response();
    }

    let mut tags = body
        .tags
        .into_iter()
        .map(|tag| sanitize::clean_line(&tag, sanitize::MAX_TAG))
        .filter(|tag| !tag.is_empty())
        .collect::<Vec<_>>();
    tags.sort();
    tags.dedup();

    if store::replace_tags(&state.db, &conversation_id, &tags).await.is_err() {
        return err(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::ServerError).into_response();
    }
    store::record_event(
        &state.db,
        "agent",
        Some(agent.agent_id.as_str()),
        "TAGS_REPLACED",
        "",
        None,
        Some(conversation_id.as_str()),
        json!({ "tags": tags }),
    )
    .await;
    ok("tags", tags).into_response()
}

async fn get_notes(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(resp) = require_agent(&state, &headers) {
        return resp.into_response();
    }
    if store::get_conversation(&state.db, &conversation_id).await.is_none() {
        return err(StatusCode::NOT_FOUND, ErrorCode::ConversationNotFound).into_response();
    }
    ok("notes", store::list_notes(&state.db, &conversation_id).await).into_response()
}

async fn add_note(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateNoteBody>,
) -> impl IntoResponse {
    let agent = match require_agent(&state, &headers) {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    if store::get_conversation(&state.db, &conversation_id).await.is_none() {
        return err(StatusCode::NOT_FOUND, ErrorCode::ConversationNotFound).into_response();
    }

    let text = sanitize::clean_text(&body.body, sanitize::MAX_NOTE_BODY);
    if text.is_empty() {
        return err(StatusCode::BAD_REQUEST, ErrorCode::InvalidInput).into_response();
    }

    let note = Note {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.clone(),
        agent_id: agent.agent_id.clone(),
        body: text,
        created_at: store::now_iso(),
    };
    if store::insert_note(&state.db, &note).await.is_err() {
        return err(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::ServerError).into_response();
    }
    store::record_event(
        &state.db,
        "agent",
        Some(agent.agent_id.as_str()),
        "NOTE_ADDED",
        "",
        None,
        Some(conversation_id.as_str()),
        json!({ "noteId": note.id }),
    )
    .await;
    (StatusCode::CREATED, ok("note", note)).into_response()
}

// ---- tickets ---------------------------------------------------------

async fn create_ticket(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CreateTicketBody>,
) -> impl IntoResponse {
    let ip = auth::client_ip(&headers, Some(peer));
    if !state
        .limiter
        .allow(
            &format!("ticket:{ip}"),
            guard::TICKET_CREATE_LIMIT,
            guard::TICKET_CREATE_WINDOW_MS,
        )
        .ok
    {
        return err(StatusCode::TOO_MANY_REQUESTS, ErrorCode::RateLimited).into_response();
    }

    let text = sanitize::clean_text(&body.body, sanitize::MAX_TICKET_BODY);
    if text.is_empty() {
        return err(StatusCode::BAD_REQUEST, ErrorCode::InvalidInput).into_response();
    }
    let session_id = sanitize::clean_line(&body.session_id, sanitize::MAX_SESSION_ID);
    let conversation_id = match body.conversation_id {
        Some(id) if !id.trim().is_empty() => {
            store::get_conversation(&state.db, id.trim()).await.map(|c| c.id)
        }
        _ => None,
    };
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let now = store::now_iso();
    let ticket = Ticket {
        id: Uuid::new_v4().to_string(),
        visitor_session_id: session_id.clone(),
        conversation_id,
        ip: ip.clone(),
        user_agent: sanitize::clean_line(user_agent, sanitize::MAX_URL),
        contact: sanitize::clean_line(&body.contact, sanitize::MAX_CONTACT),
        body: text,
        status: "open".to_string(),
        created_at: now.clone(),
        updated_at: now,
    };
    if store::insert_ticket(&state.db, &ticket).await.is_err() {
        return err(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::ServerError).into_response();
    }
    store::record_event(
        &state.db,
        "visitor",
        None,
        "TICKET_CREATED",
        &ip,
        if session_id.is_empty() { None } else { Some(session_id.as_str()) },
        ticket.conversation_id.as_deref(),
        json!({ "ticketId": ticket.id }),
    )
    .await;
    (StatusCode::CREATED, ok("ticket", ticket)).into_response()
}

#[derive(Debug, Deserialize)]
struct TicketsQuery {
    status: Option<String>,
}

async fn get_tickets(
    Query(query): Query<TicketsQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(resp) = require_agent(&state, &headers) {
        return resp.into_response();
    }
    let status = query
        .status
        .as_deref()
        .filter(|s| *s == "open" || *s == "closed");
    ok("tickets", store::list_tickets(&state.db, status).await).into_response()
}

async fn close_ticket(
    Path(ticket_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let agent = match require_agent(&state, &headers) {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    let Some(ticket) = store::close_ticket(&state.db, &ticket_id).await else {
        return err(StatusCode::NOT_FOUND, ErrorCode::InvalidInput).into_response();
    };
    store::record_event(
        &state.db,
        "agent",
        Some(agent.agent_id.as_str()),
        "TICKET_CLOSED",
        "",
        None,
        ticket.conversation_id.as_deref(),
        json!({ "ticketId": ticket.id }),
    )
    .await;
    ok("ticket", ticket).into_response()
}

// ---- queue / search / stats -----------------------------------------

/// Server-to-server snapshot: guarded by a shared secret header, not a
/// bearer token, so it is never exposed to browser clients.
async fn get_queue(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let provided = headers
        .get("x-internal-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if state.internal_secret.is_empty() || provided != state.internal_secret {
        return err(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized).into_response();
    }
    ok("queue", store::waiting_queue(&state.db).await).into_response()
}

async fn search(
    Query(query): Query<SearchQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(resp) = require_agent(&state, &headers) {
        return resp.into_response();
    }
    let term = sanitize::clean_line(&query.q, 190);
    if term.len() < 2 {
        return err(StatusCode::BAD_REQUEST, ErrorCode::InvalidInput).into_response();
    }
    ok("results", store::search_all(&state.db, &term, 25).await).into_response()
}

async fn get_stats(
    Query(query): Query<StatsQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(resp) = require_agent(&state, &headers) {
        return resp.into_response();
    }
    let from = if query.from.trim().is_empty() {
        "1970-01-01T00:00:00+00:00".to_string()
    } else {
        query.from.trim().to_string()
    };
    let to = if query.to.trim().is_empty() {
        store::now_iso()
    } else {
        query.to.trim().to_string()
    };
    ok("stats", store::stats_for_range(&state.db, &from, &to).await).into_response()
}

// ---- ip blocks -------------------------------------------------------

async fn get_ip_blocks(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp.into_response();
    }
    ok("ipBlocks", store::list_ip_blocks(&state.db).await).into_response()
}

async fn create_ip_block(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateIpBlockBody>,
) -> impl IntoResponse {
    let agent = match require_admin(&state, &headers) {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    let ip = sanitize::clean_line(&body.ip, 64);
    if ip.is_empty() {
        return err(StatusCode::BAD_REQUEST, ErrorCode::InvalidInput).into_response();
    }
    let block = IpBlock {
        ip,
        reason: sanitize::clean_line(&body.reason, 190),
        expires_at: body.expires_at.filter(|v| !v.trim().is_empty()),
        created_at: store::now_iso(),
    };
    if store::upsert_ip_block(&state.db, &block).await.is_err() {
        return err(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::ServerError).into_response();
    }
    store::record_event(
        &state.db,
        "agent",
        Some(agent.agent_id.as_str()),
        "IP_BLOCK_CREATED",
        "",
        None,
        None,
        json!({ "ip": block.ip, "reason": block.reason }),
    )
    .await;
    (StatusCode::CREATED, ok("ipBlock", block)).into_response()
}

async fn remove_ip_block(
    Path(ip): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let agent = match require_admin(&state, &headers) {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    if !store::delete_ip_block(&state.db, &ip).await {
        return err(StatusCode::NOT_FOUND, ErrorCode::InvalidInput).into_response();
    }
    store::record_event(
        &state.db,
        "agent",
        Some(agent.agent_id.as_str()),
        "IP_BLOCK_REMOVED",
        "",
        None,
        None,
        json!({ "ip": ip }),
    )
    .await;
    Json(json!({ "ok": true })).into_response()
}

// ---- widget ----------------------------------------------------------

const WIDGET_TEMPLATE: &str = include_str!("../assets/widget.js");

async fn widget_script(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let env = minijinja::Environment::new();
    let rendered = env
        .template_from_str(WIDGET_TEMPLATE)
        .and_then(|template| template.render(minijinja::context! { base_url => state.public_base_url }))
        .unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        rendered,
    )
}

// ---- bootstrap -------------------------------------------------------

fn resolve_database_url() -> String {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        return url;
    }
    let host = std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_else(|_| "postgres".to_string());
    let database = std::env::var("POSTGRES_DB").unwrap_or_else(|_| "support_chat".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{database}")
}

/// First-run convenience: seed an admin account from env when the
/// agents table is empty, so the dashboard has a way in.
async fn ensure_seed_admin(db: &sqlx::PgPool) {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM agents")
        .fetch_one(db)
        .await
        .unwrap_or(0);
    if count > 0 {
        return;
    }
    let email = std::env::var("ADMIN_EMAIL").unwrap_or_default();
    let password = std::env::var("ADMIN_PASSWORD").unwrap_or_default();
    if email.is_empty() || password.is_empty() {
        tracing::warn!("no agents exist and ADMIN_EMAIL/ADMIN_PASSWORD are unset; agent login unavailable");
        return;
    }
    let Ok(hash) = bcrypt::hash(&password, bcrypt::DEFAULT_COST) else {
        return;
    };
    let result = sqlx::query(
        "INSERT INTO agents (id, name, email, password_hash, role, created_at) \
         VALUES ($1,$2,$3,$4,'admin',$5) ON CONFLICT (email) DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind("Admin")
    .bind(email.trim().to_lowercase())
    .bind(hash)
    .bind(store::now_iso())
    .execute(db)
    .await;
    if result.is_ok() {
        tracing::info!("seeded initial admin account");
    }
}

pub async fn run() {
    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();
    let public_base_url = std::env::var("API_PUBLIC_URL")
        .unwrap_or_else(|_| format!("http://localhost:{port}"))
        .trim_end_matches('/')
        .to_string();
    let agent_token_secret = std::env::var("AGENT_TOKEN_SECRET")
        .expect("AGENT_TOKEN_SECRET must be set");
    let internal_secret = std::env::var("INTERNAL_QUEUE_SECRET").unwrap_or_default();

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    ensure_seed_admin(&db).await;

    let state = Arc::new(AppState {
        db,
        realtime: Mutex::new(RealtimeState::default()),
        next_client_id: AtomicUsize::new(0),
        limiter: Arc::new(MemoryRateLimiter::new()),
        bot_cache: Arc::new(MemoryBotConfigCache::new()),
        agent_token_secret,
        internal_secret,
        public_base_url,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/auth/login", post(login_agent))
        .route("/api/auth/me", get(get_me))
        .route(
            "/api/canned-replies",
            get(get_canned_replies).post(create_canned_reply),
        )
        .route(
            "/api/canned-replies/{canned_id}",
            patch(update_canned_reply).delete(remove_canned_reply),
        )
        .route("/api/bot/config", get(get_bot_config).put(put_bot_config))
        .route("/api/bot/events", get(get_bot_events))
        .route(
            "/api/conversations/{conversation_id}/tags",
            get(get_conversation_tags).put(put_conversation_tags),
        )
        .route(
            "/api/conversations/{conversation_id}/notes",
            get(get_notes).post(add_note),
        )
        .route("/api/tickets", get(get_tickets).post(create_ticket))
        .route("/api/tickets/{ticket_id}/close", post(close_ticket))
        .route("/api/queue", get(get_queue))
        .route("/api/search", get(search))
        .route("/api/stats", get(get_stats))
        .route("/api/ip-blocks", get(get_ip_blocks).post(create_ip_block))
        .route("/api/ip-blocks/{ip}", axum::routing::delete(remove_ip_block))
        .route("/api/widget.js", get(widget_script))
        .route("/ws/visitor", get(realtime::visitor_ws_handler))
        .route("/ws/agent", get(realtime::agent_ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    tracing::info!(%addr, "support chat server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server runtime failure");
}
