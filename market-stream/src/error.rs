use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::error::ProtocolError;

/// Internal errors generated while driving a market data stream.
///
/// None of these cross the public [`ConnectionManager`](crate::ConnectionManager) boundary;
/// they are logged and folded into store-visible [`StreamFault`](crate::store::StreamFault)s.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum StreamError {
    #[error("invalid stream url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Socket failure that leaves the connection usable (oversized frame, full buffer, ...)
    #[error("SocketError: {0}")]
    Socket(String),

    /// Socket failure after which the connection is gone
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("failed to encode outbound frame: {0}")]
    Encode(String),

    #[error("socket closed by server with code {code}: {reason}")]
    ClosedByServer { code: u16, reason: String },

    #[error("socket read timeout: no data received for {secs} seconds")]
    IdleTimeout { secs: u64 },

    #[error("stream ended without a closing frame")]
    Ended,
}

impl StreamError {
    /// Determine if an error means the socket is gone and a reconnect is needed.
    pub fn is_terminal(&self) -> bool {
        match self {
            StreamError::InvalidUrl { .. } | StreamError::Encode(_) | StreamError::Socket(_) => {
                false
            }
            StreamError::ConnectionLost(_)
            | StreamError::ClosedByServer { .. }
            | StreamError::IdleTimeout { .. }
            | StreamError::Ended => true,
        }
    }
}

impl From<WsError> for StreamError {
    fn from(value: WsError) -> Self {
        let terminal = matches!(
            value,
            WsError::ConnectionClosed
                | WsError::AlreadyClosed
                | WsError::Io(_)
                | WsError::Protocol(
                    ProtocolError::SendAfterClosing | ProtocolError::ResetWithoutClosingHandshake
                )
        );

        if terminal {
            Self::ConnectionLost(value.to_string())
        } else {
            Self::Socket(value.to_string())
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(value: serde_json::Error) -> Self {
        Self::Encode(value.to_string())
    }
}

/// Errors produced while building a [`StreamConfig`](crate::config::StreamConfig).
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConfigError {
    #[error("stream url must not be empty")]
    EmptyUrl,

    #[error("stream url {url} is invalid: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("stream url scheme must be ws or wss, got: {0}")]
    UnsupportedScheme(String),

    #[error("heartbeat interval must be greater than zero")]
    ZeroHeartbeat,

    #[error(
        "reconnect base delay {base_ms}ms must not exceed the reconnect max delay {max_ms}ms"
    )]
    BackoffInverted { base_ms: u64, max_ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_is_terminal() {
        struct TestCase {
            input: StreamError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: server close is terminal
                input: StreamError::ClosedByServer {
                    code: 1001,
                    reason: "going away".to_string(),
                },
                expected: true,
            },
            TestCase {
                // TC1: idle timeout is terminal
                input: StreamError::IdleTimeout { secs: 90 },
                expected: true,
            },
            TestCase {
                // TC2: encode failure leaves the socket alone
                input: StreamError::Encode("key must be a string".to_string()),
                expected: false,
            },
            TestCase {
                // TC3: connection lost
                input: StreamError::ConnectionLost("Connection closed normally".to_string()),
                expected: true,
            },
            TestCase {
                // TC4: socket error that is not a termination
                input: StreamError::Socket("Space limit exceeded: Message too long".to_string()),
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_terminal();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_ws_error_classification() {
        use std::io;
        use tokio_tungstenite::tungstenite::error::CapacityError;

        struct TestCase {
            input: WsError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: closed normally
                input: WsError::ConnectionClosed,
                expected: true,
            },
            TestCase {
                // TC1: used after close
                input: WsError::AlreadyClosed,
                expected: true,
            },
            TestCase {
                // TC2: write after our close frame
                input: WsError::Protocol(ProtocolError::SendAfterClosing),
                expected: true,
            },
            TestCase {
                // TC3: peer reset the TCP stream
                input: WsError::Io(io::Error::from(io::ErrorKind::ConnectionReset)),
                expected: true,
            },
            TestCase {
                // TC4: peer vanished without a close handshake
                input: WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
                expected: true,
            },
            TestCase {
                // TC5: oversized frame leaves the socket usable
                input: WsError::Capacity(CapacityError::MessageTooLong {
                    size: 100,
                    max_size: 10,
                }),
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let error = StreamError::from(test.input);
            assert_eq!(error.is_terminal(), test.expected, "TC{} failed: {}", index, error);
        }
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::BackoffInverted {
            base_ms: 5000,
            max_ms: 1000,
        };
        assert_eq!(
            error.to_string(),
            "reconnect base delay 5000ms must not exceed the reconnect max delay 1000ms"
        );
    }
}
