use super::machine::{Event, Generation};
use crate::error::StreamError;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on the graceful close handshake after cancellation.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames the driver asks the socket task to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// WebSocket protocol ping
    Ping,
}

/// Messages flowing from socket and probe tasks back to the driver.
#[derive(Debug)]
pub enum Inbound {
    Machine(Event),
    Frame { generation: Generation, text: String },
}

/// Everything a socket task needs, moved into the spawned future.
#[derive(Debug)]
pub struct SocketTask {
    pub generation: Generation,
    pub url: String,
    pub idle_timeout: Option<Duration>,
    pub inbound: mpsc::UnboundedSender<Inbound>,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub cancel: CancellationToken,
}

impl SocketTask {
    /// Drive one socket from handshake to close.
    ///
    /// Reports `SocketOpened` once the handshake completes, forwards every inbound text frame in
    /// socket order, and reports exactly one `SocketClosed` unless cancelled first. Cancellation
    /// sends a normal closure frame and exits without reporting.
    pub async fn run(self) {
        let SocketTask {
            generation,
            url,
            idle_timeout,
            inbound,
            mut outbound,
            cancel,
        } = self;

        let handshake = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(generation, "socket cancelled during handshake");
                return;
            }
            result = connect_async(url.as_str()) => result,
        };

        let stream = match handshake {
            Ok((stream, _response)) => stream,
            Err(error) => {
                let error = StreamError::from(error);
                warn!(%url, generation, %error, "failed to connect to market data stream");
                let _ = inbound.send(Inbound::Machine(Event::SocketClosed {
                    generation,
                    error,
                }));
                return;
            }
        };

        info!(%url, generation, "connected to market data stream");
        if inbound
            .send(Inbound::Machine(Event::SocketOpened { generation }))
            .is_err()
        {
            return;
        }

        let (mut write, mut read) = stream.split();
        let idle_sleep = tokio::time::sleep(idle_timeout.unwrap_or(Duration::MAX));
        tokio::pin!(idle_sleep);

        let error = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: Utf8Bytes::from_static("client disconnect"),
                    }));
                    if tokio::time::timeout(CLOSE_TIMEOUT, write.send(close))
                        .await
                        .is_err()
                    {
                        debug!(generation, "close handshake timed out");
                    }
                    debug!(generation, "socket closed by client");
                    return;
                }
                message = read.next() => {
                    if let Some(timeout) = idle_timeout {
                        idle_sleep.as_mut().reset(Instant::now() + timeout);
                    }

                    match message {
                        Some(Ok(Message::Text(text))) => {
                            let frame = Inbound::Frame {
                                generation,
                                text: text.as_str().to_owned(),
                            };
                            if inbound.send(frame).is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            match String::from_utf8(bytes.to_vec()) {
                                Ok(text) => {
                                    if inbound.send(Inbound::Frame { generation, text }).is_err() {
                                        return;
                                    }
                                }
                                Err(_) => debug!(
                                    generation,
                                    len = bytes.len(),
                                    "ignoring non-utf8 binary frame"
                                ),
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            break match frame {
                                Some(frame) => StreamError::ClosedByServer {
                                    code: u16::from(frame.code),
                                    reason: frame.reason.as_str().to_owned(),
                                },
                                None => StreamError::ClosedByServer {
                                    code: u16::from(CloseCode::Status),
                                    reason: String::new(),
                                },
                            };
                        }
                        Some(Err(error)) => break StreamError::from(error),
                        None => break StreamError::Ended,
                    }
                }
                Some(frame) = outbound.recv() => {
                    let message = match frame {
                        Outbound::Text(text) => Message::Text(text.into()),
                        Outbound::Ping => Message::Ping(Vec::new().into()),
                    };
                    if let Err(error) = write.send(message).await {
                        let error = StreamError::from(error);
                        if error.is_terminal() {
                            break error;
                        }
                        warn!(generation, %error, "failed to write market data frame");
                    }
                }
                _ = &mut idle_sleep, if idle_timeout.is_some() => {
                    break StreamError::IdleTimeout {
                        secs: idle_timeout.unwrap_or_default().as_secs(),
                    };
                }
            }
        };

        warn!(%url, generation, %error, "market data stream closed");
        let _ = inbound.send(Inbound::Machine(Event::SocketClosed { generation, error }));
    }
}
