//! WebSocket endpoint: upgrade, per-connection tasks, subscription protocol
//!
//! Each connection runs three tasks. The reader parses and applies client
//! frames, the writer owns the socket's send half (so writes are strictly
//! ordered) and emits protocol pings, and the ping monitor enforces the
//! liveness deadline. A single cancellation token is the close signal: any
//! task may trip it, and the owner then unregisters the connection, lets
//! the writer drain briefly, and drops the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use metrics::counter;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    hub::{ConnectionId, SubscribeError},
    keys::RoutingKey,
    protocol::{ClientCommand, ClientFrame, ServerMessage},
};
use crate::{auth::CurrentUser, config::RealtimeConfig, state::AppState};

/// How long the writer keeps draining queued frames after the close signal
const DRAIN_WINDOW: Duration = Duration::from_secs(1);

/// Liveness check cadence for the ping monitor
const MONITOR_TICK: Duration = Duration::from_secs(5);

/// `GET /api/v1/ws` — upgrade to a realtime connection.
///
/// Auth middleware has already run; a failed session check is an HTTP
/// error, never a WebSocket close.
pub async fn ws_handler(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ws: WebSocketUpgrade,
) -> Response {
    let max_message_bytes = state.config().realtime.max_message_bytes;
    ws.max_message_size(max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: CurrentUser) {
    let cfg = state.config().realtime.clone();
    let hub = state.hub();

    let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(cfg.outbound_queue_depth);
    let conn_id = hub.register(user.user_id, outbound_tx.clone());
    let closer = CancellationToken::new();
    let last_seen = Arc::new(AtomicI64::new(chrono::Utc::now().timestamp_millis()));

    tracing::info!(connection_id = %conn_id, user_id = %user.user_id, "websocket connected");

    let (ws_tx, ws_rx) = socket.split();

    let writer = tokio::spawn(writer_task(
        ws_tx,
        outbound_rx,
        closer.clone(),
        cfg.clone(),
    ));
    let reader = tokio::spawn(reader_task(
        ws_rx,
        state.clone(),
        conn_id,
        user.clone(),
        outbound_tx.clone(),
        closer.clone(),
        last_seen.clone(),
    ));
    let monitor = tokio::spawn(ping_monitor(
        closer.clone(),
        last_seen,
        cfg.pong_timeout(),
    ));

    // Owner: wait for the close signal, then tear down in order. The hub
    // entry goes first so no dispatch can enqueue after this point.
    closer.cancelled().await;
    hub.unregister(conn_id);
    drop(outbound_tx);

    let join = async {
        let _ = writer.await;
        let _ = reader.await;
        let _ = monitor.await;
    };
    if tokio::time::timeout(DRAIN_WINDOW + Duration::from_secs(1), join)
        .await
        .is_err()
    {
        tracing::warn!(connection_id = %conn_id, "connection tasks outlived the drain window");
    }

    tracing::info!(connection_id = %conn_id, user_id = %user.user_id, "websocket closed");
}

/// Writer: sole owner of the socket's send half.
///
/// Applies the write deadline to every frame, emits protocol pings, and on
/// the close signal drains the queue for up to one second before closing.
async fn writer_task(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Message>,
    closer: CancellationToken,
    cfg: RealtimeConfig,
) {
    let write_timeout = cfg.write_timeout();
    let mut ping = tokio::time::interval(cfg.ping_interval());
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick is immediate; skip it so pings start one interval in
    ping.tick().await;

    loop {
        tokio::select! {
            () = closer.cancelled() => break,
            _ = ping.tick() => {
                if send_with_deadline(&mut ws_tx, Message::Ping(Vec::new().into()), write_timeout)
                    .await
                    .is_err()
                {
                    closer.cancel();
                    return;
                }
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    closer.cancel();
                    return;
                };
                let closing = matches!(frame, Message::Close(_));
                if send_with_deadline(&mut ws_tx, frame, write_timeout).await.is_err() {
                    closer.cancel();
                    return;
                }
                if closing {
                    closer.cancel();
                    return;
                }
            }
        }
    }

    // Close signal from elsewhere: drain briefly, then say goodbye
    let deadline = Instant::now() + DRAIN_WINDOW;
    loop {
        let frame = match tokio::time::timeout_at(deadline, outbound_rx.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => break,
        };
        if matches!(frame, Message::Close(_))
            || send_with_deadline(&mut ws_tx, frame, write_timeout).await.is_err()
        {
            break;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

async fn send_with_deadline(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    frame: Message,
    deadline: Duration,
) -> Result<(), ()> {
    match tokio::time::timeout(deadline, ws_tx.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::debug!("websocket write failed: {e}");
            Err(())
        }
        Err(_) => {
            tracing::warn!("websocket write deadline exceeded");
            Err(())
        }
    }
}

/// Reader: parses frames, enforces the frame-rate cap, applies commands
async fn reader_task(
    mut ws_rx: SplitStream<WebSocket>,
    state: AppState,
    conn_id: ConnectionId,
    user: CurrentUser,
    outbound_tx: mpsc::Sender<Message>,
    closer: CancellationToken,
    last_seen: Arc<AtomicI64>,
) {
    let mut rate = FrameRate::new(state.config().realtime.max_frames_per_sec);
    let mut live = false;

    loop {
        let frame = tokio::select! {
            () = closer.cancelled() => return,
            frame = ws_rx.next() => frame,
        };

        last_seen.store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);

        match frame {
            Some(Ok(Message::Text(text))) => {
                if !rate.allow(Instant::now()) {
                    reply(
                        &outbound_tx,
                        ServerMessage::error("RATE_LIMIT", "too many frames"),
                    );
                    continue;
                }
                handle_text(&state, conn_id, &user, &outbound_tx, text.as_str(), &mut live).await;
            }
            Some(Ok(Message::Pong(_) | Message::Ping(_))) => {
                // Activity already recorded; the WS library answers pings
            }
            Some(Ok(Message::Binary(_))) => {
                reply(
                    &outbound_tx,
                    ServerMessage::error("INVALID_REQUEST", "binary frames are not supported"),
                );
            }
            Some(Ok(Message::Close(_))) | None => {
                closer.cancel();
                return;
            }
            Some(Err(e)) => {
                tracing::debug!(connection_id = %conn_id, "websocket read error: {e}");
                closer.cancel();
                return;
            }
        }
    }
}

async fn handle_text(
    state: &AppState,
    conn_id: ConnectionId,
    user: &CurrentUser,
    outbound_tx: &mpsc::Sender<Message>,
    raw: &str,
    live: &mut bool,
) {
    let frame = match ClientFrame::parse(raw) {
        Ok(frame) => frame,
        Err(e) => {
            reply(
                outbound_tx,
                ServerMessage::error("INVALID_REQUEST", e.to_string()),
            );
            return;
        }
    };
    let reference = frame.reference.clone();

    let command = match frame.command() {
        Ok(command) => command,
        Err(e) => {
            reply(
                outbound_tx,
                ServerMessage::error("INVALID_REQUEST", e.to_string()),
            );
            if let Some(reference) = reference {
                reply(outbound_tx, ServerMessage::nack(reference, "INVALID_REQUEST"));
            }
            return;
        }
    };

    let outcome = match command {
        ClientCommand::Subscribe { keys } => {
            apply_subscribe(state, conn_id, user, outbound_tx, &keys, live)
        }
        ClientCommand::Unsubscribe { keys } => {
            apply_unsubscribe(state, conn_id, outbound_tx, &keys)
        }
        ClientCommand::Ping => {
            reply(outbound_tx, ServerMessage::Pong {});
            Ok(())
        }
    };

    // Ack every client frame that carried a ref, success or not
    if let Some(reference) = reference {
        match outcome {
            Ok(()) => reply(outbound_tx, ServerMessage::ack(reference)),
            Err(code) => reply(outbound_tx, ServerMessage::nack(reference, code)),
        }
    }
}

/// Validate and apply a subscribe command.
///
/// Clients may follow any post or section, and only their own user stream.
/// All keys are validated before any is applied, so a rejected batch does
/// not partially subscribe.
fn apply_subscribe(
    state: &AppState,
    conn_id: ConnectionId,
    user: &CurrentUser,
    outbound_tx: &mpsc::Sender<Message>,
    raw_keys: &[String],
    live: &mut bool,
) -> Result<(), &'static str> {
    let mut keys = Vec::with_capacity(raw_keys.len());
    for raw in raw_keys {
        let key: RoutingKey = match raw.parse() {
            Ok(key) => key,
            Err(_) => {
                reply(
                    outbound_tx,
                    ServerMessage::error("INVALID_REQUEST", format!("invalid routing key: {raw}")),
                );
                return Err("INVALID_REQUEST");
            }
        };
        if let RoutingKey::User(other) = key {
            if other != user.user_id {
                reply(
                    outbound_tx,
                    ServerMessage::error("FORBIDDEN", "cannot subscribe to another user's stream"),
                );
                return Err("FORBIDDEN");
            }
        }
        keys.push(key);
    }

    for key in keys {
        match state.hub().subscribe(conn_id, key) {
            Ok(()) => {}
            Err(SubscribeError::LimitExceeded) => {
                reply(
                    outbound_tx,
                    ServerMessage::error("SUBSCRIPTION_LIMIT", "subscription limit reached"),
                );
                return Err("SUBSCRIPTION_LIMIT");
            }
            Err(SubscribeError::UnknownConnection) => return Err("INTERNAL_ERROR"),
        }
    }

    if !*live {
        *live = true;
        tracing::debug!(connection_id = %conn_id, "connection live");
    }
    Ok(())
}

fn apply_unsubscribe(
    state: &AppState,
    conn_id: ConnectionId,
    outbound_tx: &mpsc::Sender<Message>,
    raw_keys: &[String],
) -> Result<(), &'static str> {
    for raw in raw_keys {
        match raw.parse::<RoutingKey>() {
            Ok(key) => state.hub().unsubscribe(conn_id, key),
            Err(_) => {
                reply(
                    outbound_tx,
                    ServerMessage::error("INVALID_REQUEST", format!("invalid routing key: {raw}")),
                );
                return Err("INVALID_REQUEST");
            }
        }
    }
    Ok(())
}

/// Enqueue a control reply; a full queue drops it like any other frame
fn reply(outbound_tx: &mpsc::Sender<Message>, message: ServerMessage) {
    if outbound_tx
        .try_send(Message::Text(message.to_json().into()))
        .is_err()
    {
        counter!("websocket.errors", "error_type" => "queue_full").increment(1);
    }
}

/// Ping monitor: closes the connection when the peer stops responding
async fn ping_monitor(
    closer: CancellationToken,
    last_seen: Arc<AtomicI64>,
    pong_timeout: Duration,
) {
    let mut tick = tokio::time::interval(MONITOR_TICK);
    loop {
        tokio::select! {
            () = closer.cancelled() => return,
            _ = tick.tick() => {
                let idle_millis =
                    chrono::Utc::now().timestamp_millis() - last_seen.load(Ordering::Relaxed);
                if idle_millis > pong_timeout.as_millis() as i64 {
                    tracing::info!("websocket liveness deadline passed, closing");
                    closer.cancel();
                    return;
                }
            }
        }
    }
}

/// One-second fixed window over inbound frames
struct FrameRate {
    max_per_sec: u32,
    window_start: Instant,
    count: u32,
}

impl FrameRate {
    fn new(max_per_sec: u32) -> Self {
        Self {
            max_per_sec,
            window_start: Instant::now(),
            count: 0,
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        self.count <= self.max_per_sec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_rate_caps_within_a_window() {
        tokio::time::pause();
        let mut rate = FrameRate::new(3);
        let start = Instant::now();

        assert!(rate.allow(start));
        assert!(rate.allow(start));
        assert!(rate.allow(start));
        assert!(!rate.allow(start));
        assert!(!rate.allow(start + Duration::from_millis(900)));
    }

    #[tokio::test]
    async fn frame_rate_resets_each_second() {
        tokio::time::pause();
        let mut rate = FrameRate::new(2);
        let start = Instant::now();

        assert!(rate.allow(start));
        assert!(rate.allow(start));
        assert!(!rate.allow(start));
        assert!(rate.allow(start + Duration::from_secs(1)));
        assert!(rate.allow(start + Duration::from_secs(1)));
        assert!(!rate.allow(start + Duration::from_secs(1)));
    }
}
