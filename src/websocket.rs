//! # WebSocket Update Channel
//!
//! Clients connect to `/ws/updates` to follow transcriptions live and to
//! drive the queue without polling the REST API.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: The socket subscribes to transcription and queue updates
//!    (subscribing also starts task processing)
//! 2. **Server → Client**: `transcription` on every published result,
//!    `queue` on every queue change, replies to commands, and `ping`
//! 3. **Client → Server**: `enqueue`, `cancel`, `cancel_all`, and `pong`
//! 4. **Heartbeat**: A ping every 30 seconds; silent clients are dropped after 60
//!
//! ## Message Format:
//! JSON text frames tagged by `type`, e.g.
//! `{"type": "cancel", "file_name": "meeting.wav"}`.

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::handlers::tasks::{submit, EnqueueRequest};
use crate::state::AppState;
use crate::transcription::{Transcription, TranscriptionTask};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages accepted from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Enqueue(EnqueueRequest),
    Cancel { file_name: String },
    CancelAll,
    /// Heartbeat response, echoing the ping's timestamp
    Pong { timestamp: u64 },
}

/// Messages pushed to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Transcription { transcription: Transcription },
    /// Full queue, running task first
    Queue { tasks: Vec<TranscriptionTask> },
    Enqueued { file_name: String, queued: bool },
    Canceled { file_name: String, found: bool },
    CanceledAll { removed: usize },
    Error { code: String, message: String },
    Ping { timestamp: u64 },
}

impl ServerMessage {
    fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Worker updates fed into the actor as a stream.
#[derive(Debug)]
enum WorkerUpdate {
    Transcription(Transcription),
    Queue(Vec<TranscriptionTask>),
}

/// Serialized reply produced by a spawned command.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// One connected client.
pub struct UpdatesWebSocket {
    state: AppState,
    last_heartbeat: Instant,
}

impl UpdatesWebSocket {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!("Failed to serialize WebSocket message: {}", err),
        }
    }

    /// Run a worker command off the actor and send its reply back through it.
    fn handle_command(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let state = self.state.clone();
        let addr = ctx.address();

        tokio::spawn(async move {
            let reply = match message {
                ClientMessage::Enqueue(request) => match submit(&state, request).await {
                    Ok((queued, task)) => ServerMessage::Enqueued {
                        file_name: task.file_name,
                        queued,
                    },
                    Err(err) => ServerMessage::error("enqueue_failed", err.to_string()),
                },
                ClientMessage::Cancel { file_name } => {
                    let found = state.worker.cancel(&file_name).await;
                    ServerMessage::Canceled { file_name, found }
                }
                ClientMessage::CancelAll => ServerMessage::CanceledAll {
                    removed: state.worker.cancel_all().await,
                },
                ClientMessage::Pong { .. } => return,
            };

            if let Ok(json) = serde_json::to_string(&reply) {
                addr.do_send(SendText(json));
            }
        });
    }
}

impl Actor for UpdatesWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Update WebSocket connected");

        let transcriptions = self
            .state
            .worker
            .transcription_updates()
            .map(WorkerUpdate::Transcription);
        let queue = self.state.worker.queue_updates().map(WorkerUpdate::Queue);
        ctx.add_stream(transcriptions);
        ctx.add_stream(queue);

        // Current queue right away, later snapshots arrive as updates
        let tasks = self.state.worker.current_tasks();
        self.send(ctx, &ServerMessage::Queue { tasks });

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
            act.send(ctx, &ServerMessage::Ping { timestamp });
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Update WebSocket disconnected");
    }
}

impl StreamHandler<WorkerUpdate> for UpdatesWebSocket {
    fn handle(&mut self, update: WorkerUpdate, ctx: &mut Self::Context) {
        let message = match update {
            WorkerUpdate::Transcription(transcription) => {
                ServerMessage::Transcription { transcription }
            }
            WorkerUpdate::Queue(tasks) => ServerMessage::Queue { tasks },
        };
        self.send(ctx, &message);
    }

    // An update stream only ends when the worker is gone
    fn finished(&mut self, ctx: &mut Self::Context) {
        warn!("Worker update stream ended, closing WebSocket");
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for UpdatesWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Pong { timestamp }) => {
                    debug!(timestamp, "Heartbeat pong");
                    self.last_heartbeat = Instant::now();
                }
                Ok(message) => {
                    self.last_heartbeat = Instant::now();
                    self.handle_command(message, ctx);
                }
                Err(err) => {
                    self.send(ctx, &ServerMessage::error("invalid_json", format!("Invalid JSON: {}", err)));
                }
            },
            Ok(ws::Message::Binary(_)) => {
                self.send(ctx, &ServerMessage::error("unsupported", "Binary frames are not accepted"));
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for UpdatesWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

pub async fn updates_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());
    ws::start(UpdatesWebSocket::new(state.get_ref().clone()), &req, stream)
}
