//! # Session WebSocket
//!
//! Clients connect to `/ws/sessions/{durable_id}` after starting a session to
//! follow it live. Audio itself flows directly between the client and the
//! engine; this socket carries lifecycle notices only.
//!
//! ## Protocol:
//! - **Server → Client**: `SessionNotice` JSON (`phase`, `engine`, `ended`), plus
//!   `ping` heartbeats and command results
//! - **Client → Server**: `{"type":"end"}` to end the session, `{"type":"pong"}`
//!
//! Disconnecting, or missing heartbeats for `CLIENT_TIMEOUT`, ends the session
//! with reason `user_cancelled`.

use crate::delivery::EndReason;
use crate::error::AppError;
use crate::orchestrator::{SessionNotice, SessionOrchestrator};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages the client may send.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    End,
    Pong,
}

/// Socket-level messages the server sends alongside session notices.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ping { timestamp: i64 },
    EndResult { durable_id: String, ended: bool, message: Option<String> },
    Error { code: String, message: String },
}

/// Send a pre-serialized text frame from outside the actor.
#[derive(Message)]
#[rtype(result = "()")]
pub struct SendText(pub String);

pub struct SessionSocket {
    durable_id: String,
    orchestrator: SessionOrchestrator,
    notices: Option<broadcast::Receiver<SessionNotice>>,
    last_heartbeat: Instant,
    /// Set once the session ended, so stopping does not end it again
    session_over: bool,
}

impl SessionSocket {
    pub fn new(
        durable_id: String,
        orchestrator: SessionOrchestrator,
        notices: broadcast::Receiver<SessionNotice>,
    ) -> Self {
        Self {
            durable_id,
            orchestrator,
            notices: Some(notices),
            last_heartbeat: Instant::now(),
            session_over: false,
        }
    }

    fn send(ctx: &mut ws::WebsocketContext<Self>, message: &impl Serialize) {
        if let Ok(json) = serde_json::to_string(message) {
            ctx.text(json);
        }
    }

    fn request_end(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let orchestrator = self.orchestrator.clone();
        let durable_id = self.durable_id.clone();
        let addr = ctx.address();

        actix_web::rt::spawn(async move {
            let reply = match orchestrator.end(&durable_id, EndReason::UserCancelled).await {
                Ok(_) => ServerMessage::EndResult { durable_id, ended: true, message: None },
                Err(err) => ServerMessage::EndResult { durable_id, ended: false, message: Some(err.to_string()) },
            };
            if let Ok(json) = serde_json::to_string(&reply) {
                addr.do_send(SendText(json));
            }
        });
    }
}

impl Actor for SessionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(durable_id = %self.durable_id, "Session socket connected");

        if let Some(notices) = self.notices.take() {
            ctx.add_stream(BroadcastStream::new(notices));
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(durable_id = %act.durable_id, "Session socket heartbeat timeout, closing");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
            Self::send(ctx, &ServerMessage::Ping { timestamp: chrono::Utc::now().timestamp_millis() });
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(durable_id = %self.durable_id, session_over = self.session_over, "Session socket closed");
        if self.session_over {
            return;
        }

        let orchestrator = self.orchestrator.clone();
        let durable_id = self.durable_id.clone();
        actix_web::rt::spawn(async move {
            if let Err(err) = orchestrator.end(&durable_id, EndReason::UserCancelled).await {
                warn!(durable_id = %durable_id, error = %err, "Could not end session after disconnect");
            }
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::End) => self.request_end(ctx),
                    Ok(ClientMessage::Pong) => {}
                    Err(err) => Self::send(
                        ctx,
                        &ServerMessage::Error {
                            code: "invalid_message".to_string(),
                            message: err.to_string(),
                        },
                    ),
                }
            }
            Ok(ws::Message::Binary(_)) => {
                Self::send(
                    ctx,
                    &ServerMessage::Error {
                        code: "unsupported".to_string(),
                        message: "audio is sent to the engine directly".to_string(),
                    },
                );
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(durable_id = %self.durable_id, reason = ?reason, "Client closed session socket");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(durable_id = %self.durable_id, error = %err, "Session socket protocol error");
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<SessionNotice, BroadcastStreamRecvError>> for SessionSocket {
    fn handle(&mut self, notice: Result<SessionNotice, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match notice {
            Ok(notice) => {
                let ended = matches!(notice, SessionNotice::Ended { .. });
                Self::send(ctx, &notice);
                if ended {
                    self.session_over = true;
                    ctx.close(Some(ws::CloseCode::Normal.into()));
                    ctx.stop();
                }
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(durable_id = %self.durable_id, skipped, "Session socket fell behind, notices skipped");
            }
        }
    }

    /// The notice channel closes once the session is gone.
    fn finished(&mut self, ctx: &mut Self::Context) {
        self.session_over = true;
        ctx.stop();
    }
}

impl Handler<SendText> for SessionSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// `GET /ws/sessions/{id}`: upgrade to a session socket for a live session.
pub async fn session_socket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let durable_id = path.into_inner();
    let notices = state
        .orchestrator
        .subscribe(&durable_id)
        .ok_or_else(|| AppError::NotFound(format!("live session {}", durable_id)))?;

    ws::start(
        SessionSocket::new(durable_id, state.orchestrator.clone(), notices),
        &req,
        stream,
    )
    .map_err(|e| AppError::BadRequest(format!("WebSocket handshake failed: {}", e)))
}
