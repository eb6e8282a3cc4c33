//! WebSocket upgrade handler

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::game::{Command, MatchControl};
use crate::session::{SessionId, SessionLink};
use crate::util::rate_limit::SessionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{encode_disconnect, Hello, Message, ProtocolError, PROTOCOL_VERSION};

/// Time a client has to send its Hello
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Server heartbeat period
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Time the writer gets to flush a closing session
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocket, WsMessage>;
type WsStream = SplitStream<WebSocket>;

/// Handshake failures
#[derive(Debug, thiserror::Error)]
enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,

    #[error("connection closed during handshake")]
    Closed,

    #[error("binary frames only")]
    TextFrame,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_hello(&mut ws_stream)).await {
        Ok(Ok(hello)) => hello,
        Ok(Err(e)) => {
            warn!(error = %e, "Handshake failed");
            reject(&mut ws_sink, &e.to_string()).await;
            return;
        }
        Err(_) => {
            warn!("Handshake timed out");
            reject(&mut ws_sink, &HandshakeError::Timeout.to_string()).await;
            return;
        }
    };

    if hello.version != PROTOCOL_VERSION {
        let e = ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: hello.version,
        };
        warn!(player_id = %hello.player_id, error = %e, "Rejecting client");
        reject(&mut ws_sink, &e.to_string()).await;
        return;
    }

    info!(
        player_id = %hello.player_id,
        resume_session = ?hello.resume_session,
        "New WebSocket connection"
    );

    let placed = match hello.resume_session {
        Some(session) => resume(&state, &hello, session).await,
        None => enqueue(&state, &hello, &mut ws_stream).await,
    };

    let link = match placed {
        Ok(link) => link,
        Err(reason) => {
            info!(player_id = %hello.player_id, reason = %reason, "Connection not placed");
            reject(&mut ws_sink, &reason).await;
            return;
        }
    };

    run_session(link.clone(), state.sim.tick_rate.ticks_per_second(), ws_sink, ws_stream).await;

    info!(player_id = %hello.player_id, session_id = link.id(), "WebSocket connection closed");
}

/// Wait for the client's Hello
async fn read_hello(stream: &mut WsStream) -> Result<Hello, HandshakeError> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Binary(data)) => {
                return match Message::decode(&data)? {
                    Message::Hello(hello) => Ok(hello),
                    other => Err(ProtocolError::Unexpected(other.message_type()).into()),
                };
            }
            Ok(WsMessage::Text(_)) => return Err(HandshakeError::TextFrame),
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(WsMessage::Close(_)) | Err(_) => return Err(HandshakeError::Closed),
        }
    }
    Err(HandshakeError::Closed)
}

/// New player: queue for a match and join it once assigned
async fn enqueue(
    state: &AppState,
    hello: &Hello,
    stream: &mut WsStream,
) -> Result<Arc<SessionLink>, String> {
    let session = state.directory.allocate();
    let mut assignment_rx = state
        .matchmaking
        .join_queue(hello.player_id, session)
        .await
        .map_err(|e| e.to_string())?;

    // Watch the socket while waiting so a departed player leaves the queue
    let assignment = loop {
        tokio::select! {
            assigned = &mut assignment_rx => match assigned {
                Ok(assignment) => break assignment,
                Err(_) => return Err("removed from matchmaking queue".to_string()),
            },
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                    state.matchmaking.leave_queue(hello.player_id).await;
                    return Err("connection closed while queued".to_string());
                }
                Some(Ok(_)) => {
                    debug!(player_id = %hello.player_id, "Ignoring frame while queued");
                }
            },
        }
    };

    let link = new_link(state, session);
    assignment
        .handle
        .send(MatchControl::Join {
            session,
            player_id: hello.player_id,
            link: link.clone(),
        })
        .await
        .map_err(|e| e.to_string())?;

    info!(
        player_id = %hello.player_id,
        session_id = session,
        match_id = %assignment.match_id,
        team = assignment.team,
        "Player placed in match"
    );
    Ok(link)
}

/// Returning player: attach a new link to the dropped session
async fn resume(state: &AppState, hello: &Hello, session: SessionId) -> Result<Arc<SessionLink>, String> {
    let route = state
        .directory
        .route(session)
        .filter(|route| route.player_id == hello.player_id)
        .ok_or_else(|| format!("session {session} cannot be resumed"))?;
    let handle = state
        .registry
        .get(&route.match_id)
        .ok_or_else(|| "match is over".to_string())?;

    let link = new_link(state, session);
    let (reply, outcome) = oneshot::channel();
    handle
        .send(MatchControl::Reconnect {
            session,
            player_id: hello.player_id,
            link: link.clone(),
            reply,
        })
        .await
        .map_err(|e| e.to_string())?;

    match outcome.await {
        Ok(Ok(())) => {
            info!(player_id = %hello.player_id, session_id = session, match_id = %route.match_id, "Session resumed");
            Ok(link)
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("match is over".to_string()),
    }
}

fn new_link(state: &AppState, session: SessionId) -> Arc<SessionLink> {
    let history_ms = state.sim.tick_rate.interval_ms() * state.sim.snapshot_capacity as u64;
    Arc::new(
        SessionLink::new(
            session,
            state.sim.ingress_capacity,
            state.sim.egress_capacity,
            unix_millis(),
        )
        .with_max_rtt_ms(history_ms),
    )
}

/// Run the WebSocket session with read/write split
async fn run_session(link: Arc<SessionLink>, tick_rate: u32, mut ws_sink: WsSink, mut ws_stream: WsStream) {
    let session = link.id();

    // Spawn writer task: egress queue -> WebSocket
    let writer_link = link.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = writer_link.next_outbound().await {
            if let Err(e) = ws_sink.send(WsMessage::Binary(frame.to_vec())).await {
                debug!(session_id = session, error = %e, "WebSocket send failed");
                writer_link.close();
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    // Heartbeats for RTT measurement
    let heartbeat_link = link.clone();
    let heartbeat = tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            if heartbeat_link.is_closed() {
                break;
            }
            let origin_ms = unix_millis();
            let sequence = heartbeat_link.begin_heartbeat(origin_ms);
            heartbeat_link.send(
                Message::Heartbeat {
                    sequence,
                    origin_ms,
                    echo: false,
                }
                .encode(),
            );
        }
    });

    // Reader loop: WebSocket -> session link
    let rate_limiter = SessionRateLimiter::new(tick_rate);
    while let Some(result) = ws_stream.next().await {
        if link.is_closed() {
            break;
        }
        match result {
            Ok(WsMessage::Binary(data)) => {
                if !rate_limiter.check_inbound() {
                    debug!(session_id = session, "Rate limited inbound frame");
                    continue;
                }
                if let Err(e) = handle_frame(&link, &data) {
                    warn!(session_id = session, error = %e, severity = %e.severity(), "Protocol error, disconnecting");
                    link.send(encode_disconnect(&e.to_string()));
                    break;
                }
            }
            Ok(WsMessage::Text(_)) => {
                warn!(session_id = session, "Received text frame, disconnecting");
                link.send(encode_disconnect("binary frames only"));
                break;
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(WsMessage::Close(_)) => {
                info!(session_id = session, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(session_id = session, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // The match notices the closed link at its next tick
    link.close();
    heartbeat.abort();
    if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        debug!(session_id = session, "Writer did not flush in time");
    }
}

/// Apply one inbound frame to the session link
fn handle_frame(link: &SessionLink, data: &[u8]) -> Result<(), ProtocolError> {
    match Message::decode(data)? {
        Message::Command {
            sequence,
            client_tick,
            action,
        } => link.push_command(Command {
            session: link.id(),
            sequence,
            client_tick,
            action,
            received_at_ms: unix_millis(),
        }),
        Message::Ack { tick } => link.ack(tick),
        Message::Heartbeat {
            sequence,
            origin_ms,
            echo: false,
        } => link.send(
            Message::Heartbeat {
                sequence,
                origin_ms,
                echo: true,
            }
            .encode(),
        ),
        Message::Heartbeat {
            sequence, echo: true, ..
        } => {
            if !link.complete_heartbeat(sequence, unix_millis()) {
                debug!(session_id = link.id(), sequence, "Ignoring unsolicited heartbeat echo");
            }
        }
        Message::Disconnect { reason } => {
            info!(session_id = link.id(), reason = %reason, "Client disconnected");
            link.close();
        }
        other => return Err(ProtocolError::Unexpected(other.message_type())),
    }
    Ok(())
}

/// Send a Disconnect before any session exists, then close
async fn reject(sink: &mut WsSink, reason: &str) {
    let frame: Bytes = encode_disconnect(reason);
    if sink.send(WsMessage::Binary(frame.to_vec())).await.is_ok() {
        let _ = sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{Action, Vec2};
    use crate::ws::protocol::{MessageType, Welcome};

    fn frame(message: Message) -> Vec<u8> {
        message.encode().to_vec()
    }

    #[test]
    fn commands_and_acks_reach_the_link() {
        let link = SessionLink::new(4, 8, 8, 0);
        handle_frame(
            &link,
            &frame(Message::Command {
                sequence: 3,
                client_tick: 10,
                action: Action::Move {
                    displacement: Vec2::new(0.5, 0.0),
                },
            }),
        )
        .unwrap();
        handle_frame(&link, &frame(Message::Ack { tick: 9 })).unwrap();

        assert_eq!(link.ingress().len(), 1);
        assert_eq!(link.acked_tick(), Some(9));
        assert!(link.last_command_ms() > 0);
    }

    #[test]
    fn client_heartbeat_is_echoed() {
        let link = SessionLink::new(4, 8, 8, 0);
        handle_frame(
            &link,
            &frame(Message::Heartbeat {
                sequence: 7,
                origin_ms: 123,
                echo: false,
            }),
        )
        .unwrap();
        let echoed = Message::decode(&link.try_next_outbound().unwrap()).unwrap();
        assert_eq!(
            echoed,
            Message::Heartbeat {
                sequence: 7,
                origin_ms: 123,
                echo: true
            }
        );
    }

    #[test]
    fn echoed_heartbeat_updates_rtt() {
        let link = SessionLink::new(4, 8, 8, 0);
        let origin_ms = unix_millis() - 80;
        let sequence = link.begin_heartbeat(origin_ms);
        handle_frame(
            &link,
            &frame(Message::Heartbeat {
                sequence,
                origin_ms,
                echo: true,
            }),
        )
        .unwrap();
        assert!(link.rtt_ms() >= 80.0);
    }

    #[test]
    fn forged_heartbeat_echo_leaves_rtt_unchanged() {
        let link = SessionLink::new(4, 8, 8, 0).with_max_rtt_ms(3_000);
        handle_frame(
            &link,
            &frame(Message::Heartbeat {
                sequence: 99,
                origin_ms: 0,
                echo: true,
            }),
        )
        .unwrap();
        assert_eq!(link.rtt_ms(), 0.0);

        // A real sequence with a rewritten origin is timed from the server's send
        let sequence = link.begin_heartbeat(unix_millis() - 40);
        handle_frame(
            &link,
            &frame(Message::Heartbeat {
                sequence,
                origin_ms: 0,
                echo: true,
            }),
        )
        .unwrap();
        let rtt = link.rtt_ms();
        assert!((40.0..3_000.0).contains(&rtt), "rtt = {rtt}");
    }

    #[test]
    fn client_disconnect_closes_link() {
        let link = SessionLink::new(4, 8, 8, 0);
        handle_frame(&link, &frame(Message::Disconnect { reason: "bye".into() })).unwrap();
        assert!(link.is_closed());
    }

    #[test]
    fn server_only_messages_are_protocol_errors() {
        let link = SessionLink::new(4, 8, 8, 0);
        let welcome = Message::Welcome(Welcome {
            tick: 1,
            session: 4,
            tick_rate: 20,
            interp_delay_ms: 100,
            entity: 1,
        });
        assert_eq!(
            handle_frame(&link, &frame(welcome)),
            Err(ProtocolError::Unexpected(MessageType::Welcome))
        );

        let truncated = &frame(Message::Ack { tick: 1 })[..3];
        assert!(matches!(
            handle_frame(&link, truncated),
            Err(ProtocolError::Truncated { .. })
        ));
    }
}
