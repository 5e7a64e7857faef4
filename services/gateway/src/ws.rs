// Connection Gateway: upgrade handshake + per-connection I/O loop, per
// spec.md §4.G. One dedicated reader task owns the socket's receive half;
// writes (both the reader's own responses and the Fan-out Pusher's
// concurrent pushes) go through `Session::send_envelope`, which serializes
// them on a mutex around the send half, mirroring `services/server`'s
// `Arc<Mutex<..>>`-guarded WS send idiom. Unlike `ws_forwarder.rs`'s teacher
// handler, which never shares socket ownership, this handler splits the
// socket up front so the Pusher can write from its own task.

use std::time::Duration;

use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use im_allocator::SeqCache;
use im_cache::RawStore;
use im_protocol::{codes, req_identifier, InEnvelope, OutEnvelope, UpgradeParams, GZIP_COMPRESSION, WEB_PLATFORM_ID};
use im_store::{MessageStore, SeqStore};
use tracing::{debug, info, warn};

use crate::dispatch::dispatch;
use crate::session::{gunzip, Session};
use crate::state::AppState;

/// gorilla-websocket-style pong-wait / ping-period pair: the server expects
/// some frame (including its own pings) at least this often, and nudges a
/// web client with a server-initiated ping at 90% of that interval so the
/// client's own pong keeps the deadline from lapsing under normal load.
const PONG_WAIT: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_millis(PONG_WAIT.as_millis() as u64 * 9 / 10);

pub async fn ws_handler<Csq, Rs, St>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<Csq, Rs, St>>,
    Query(params): Query<UpgradeParams>,
) -> impl IntoResponse
where
    Csq: SeqCache + 'static,
    Rs: RawStore + 'static,
    St: MessageStore + SeqStore + 'static,
{
    let Some(user_id) = state.identity_verifier.verify(&params.token).await else {
        return (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response();
    };
    if !state.try_acquire_connection_slot() {
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, params.platform_id, params.compression))
        .into_response()
}

async fn handle_socket<Csq, Rs, St>(
    socket: WebSocket,
    state: AppState<Csq, Rs, St>,
    user_id: String,
    platform_id: i32,
    compression: Option<String>,
)
where
    Csq: SeqCache + 'static,
    Rs: RawStore + 'static,
    St: MessageStore + SeqStore + 'static,
{
    let (sink, mut stream) = socket.split();
    let session = Session::new(user_id.clone(), platform_id, compression.clone(), sink);
    let is_gzip = compression.as_deref() == Some(GZIP_COMPRESSION);

    let existing = state.registry.set(session.clone()).await;
    let to_kick = state.kick_policy.on_new_session(&user_id, platform_id, &existing).await;
    for victim in to_kick {
        let kick = OutEnvelope::ok(req_identifier::WS_KICK_ONLINE_MSG, String::new(), serde_json::Value::Null);
        victim.send_envelope(&kick).await;
        victim.close(&state.registry).await;
    }
    info!(user_id, platform_id, session_id = session.id(), "session established");

    let mut ping_ticker = tokio::time::interval(PING_PERIOD);
    ping_ticker.tick().await;

    loop {
        tokio::select! {
            frame = tokio::time::timeout(PONG_WAIT, stream.next()) => {
                match frame {
                    Ok(Some(Ok(WsFrame::Text(text)))) => {
                        session.touch().await;
                        state.registry.touch_user(&user_id).await;
                        handle_frame(&state, &session, &user_id, text.as_bytes()).await;
                    }
                    Ok(Some(Ok(WsFrame::Binary(bytes)))) => {
                        session.touch().await;
                        state.registry.touch_user(&user_id).await;
                        let decoded = if is_gzip {
                            match gunzip(&bytes) {
                                Ok(d) => d,
                                Err(e) => { warn!(user_id, error = %e, "gunzip failed"); continue; }
                            }
                        } else {
                            bytes.to_vec()
                        };
                        handle_frame(&state, &session, &user_id, &decoded).await;
                    }
                    Ok(Some(Ok(WsFrame::Ping(_)))) | Ok(Some(Ok(WsFrame::Pong(_)))) => {
                        session.touch().await;
                    }
                    Ok(Some(Ok(WsFrame::Close(_)))) | Ok(None) => {
                        debug!(user_id, "client closed connection");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        warn!(user_id, error = %e, "websocket read error");
                        break;
                    }
                    Err(_) => {
                        warn!(user_id, "read deadline elapsed, closing idle session");
                        break;
                    }
                }
            }
            _ = ping_ticker.tick(), if platform_id == WEB_PLATFORM_ID => {
                if !session.send_raw(WsFrame::Ping(Vec::new().into())).await {
                    break;
                }
            }
        }
        if session.is_closed() {
            break;
        }
    }

    session.close(&state.registry).await;
    state.release_connection_slot();
    info!(user_id, session_id = session.id(), "session ended");
}

async fn handle_frame<Csq, Rs, St>(state: &AppState<Csq, Rs, St>, session: &Session, user_id: &str, payload: &[u8])
where
    Csq: SeqCache + 'static,
    Rs: RawStore + 'static,
    St: MessageStore + SeqStore + 'static,
{
    let env: InEnvelope = match serde_json::from_slice(payload) {
        Ok(env) => env,
        Err(e) => {
            warn!(user_id, error = %e, "inbound frame was not a valid envelope");
            let out = OutEnvelope::error(0, String::new(), codes::INVALID_REQUEST, "malformed envelope");
            session.send_envelope(&out).await;
            return;
        }
    };
    let out = dispatch(state, user_id, env).await;
    session.send_envelope(&out).await;
}
