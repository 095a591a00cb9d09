//! Poll transport adapter: HTTP request/response exchanges
//!
//! Firewall/NAT-friendly counterpart to the stream adapter. Every
//! operation is stateless per request: the delimited payload arrives
//! either in the request body or in the single query parameter `p`,
//! and every response body is delimited text so clients can parse with
//! a plain split. Errors are an HTTP status plus an `ERROR|...` line,
//! never structured data.

use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use log::debug;
use serde::Deserialize;
use shared::PollRequest;
use std::net::SocketAddr;

use crate::relay::{JoinError, SessionError, SharedRelay};

/// Shared state for the poll routes.
#[derive(Clone)]
pub struct PollState {
    pub relay: SharedRelay,
    /// Address advertised in `list` responses (not the bind address,
    /// which may be 0.0.0.0).
    pub advertise_addr: String,
    /// Stream port advertised in `list` responses.
    pub port: u16,
}

/// The single query parameter alternative to a request body.
#[derive(Debug, Deserialize)]
struct PollQuery {
    p: Option<String>,
}

/// Builds the poll router. Exposed separately from serving so tests
/// can drive it without a socket.
pub fn router(state: PollState) -> Router {
    Router::new()
        .route("/join", get(join).post(join))
        .route("/sync", get(sync).post(sync))
        .route("/chat", get(chat).post(chat))
        .route("/leave", get(leave).post(leave))
        .route("/list", get(list).post(list))
        .with_state(state)
}

/// Serves the poll transport on an already-bound listener.
pub async fn run_http(
    listener: tokio::net::TcpListener,
    state: PollState,
) -> Result<(), std::io::Error> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

fn payload(query: PollQuery, body: String) -> String {
    query.p.unwrap_or(body)
}

fn bad_request() -> Response {
    (StatusCode::BAD_REQUEST, "ERROR|bad request\n").into_response()
}

fn invalid_session() -> Response {
    (StatusCode::FORBIDDEN, "ERROR|invalid session\n").into_response()
}

/// `join` — admission, token mint, and the initial batch.
async fn join(
    State(state): State<PollState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<PollQuery>,
    body: String,
) -> Response {
    let Some(PollRequest::Join {
        name,
        character_name,
        character_index,
    }) = PollRequest::decode(&payload(query, body))
    else {
        return bad_request();
    };

    match state
        .relay
        .lock()
        .await
        .join_poll(name, character_name, character_index, addr)
    {
        Ok(batch) => (StatusCode::OK, batch).into_response(),
        Err(JoinError::Full) => {
            (StatusCode::SERVICE_UNAVAILABLE, "ERROR|full\n").into_response()
        }
    }
}

/// `sync` — heartbeat, optional position relay, queue drain.
async fn sync(
    State(state): State<PollState>,
    Query(query): Query<PollQuery>,
    body: String,
) -> Response {
    let Some(PollRequest::Sync { token, pos }) = PollRequest::decode(&payload(query, body))
    else {
        return bad_request();
    };

    match state.relay.lock().await.sync(&token, pos) {
        Ok(batch) => (StatusCode::OK, batch).into_response(),
        Err(SessionError::InvalidToken) => invalid_session(),
    }
}

/// `chat` — relays a chat line from a token-validated session.
async fn chat(
    State(state): State<PollState>,
    Query(query): Query<PollQuery>,
    body: String,
) -> Response {
    let Some(PollRequest::Chat { token, text }) = PollRequest::decode(&payload(query, body))
    else {
        return bad_request();
    };

    match state.relay.lock().await.poll_chat(&token, text) {
        Ok(()) => (StatusCode::OK, "OK\n").into_response(),
        Err(SessionError::InvalidToken) => invalid_session(),
    }
}

/// `leave` — explicit departure.
async fn leave(
    State(state): State<PollState>,
    Query(query): Query<PollQuery>,
    body: String,
) -> Response {
    let Some(PollRequest::Leave { token }) = PollRequest::decode(&payload(query, body)) else {
        return bad_request();
    };

    match state.relay.lock().await.poll_leave(&token) {
        Ok(()) => (StatusCode::OK, "OK\n").into_response(),
        Err(SessionError::InvalidToken) => invalid_session(),
    }
}

/// `list` — read-only discovery metadata; no session required.
async fn list(State(state): State<PollState>) -> Response {
    debug!("Discovery list request");
    let record = state
        .relay
        .lock()
        .await
        .list_record(&state.advertise_addr, state.port);
    (StatusCode::OK, record).into_response()
}
