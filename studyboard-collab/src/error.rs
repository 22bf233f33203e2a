use studyboard_core::ReplicaError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported endpoint `{0}`: expected a ws:// or wss:// url")]
    Scheme(String),
    #[error("endpoint `{0}` cannot carry a room path")]
    CannotBeBase(String),
    #[error("websocket: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),
    #[error("connection attempt timed out")]
    Timeout,
    #[error("relay rejected the connection: {0}")]
    Rejected(String),
    #[error("no target to reconnect to")]
    NoTarget,
    #[error("transport needs a running tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        TransportError::WebSocket(Box::new(e))
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),
    #[error("invalid relay configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

impl From<tungstenite::Error> for RelayError {
    fn from(e: tungstenite::Error) -> Self {
        RelayError::WebSocket(Box::new(e))
    }
}

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("sync session needs a running tokio runtime")]
    NoRuntime,
    #[error("sync session was torn down")]
    TornDown,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
