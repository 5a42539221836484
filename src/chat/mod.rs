pub mod log;
pub mod machine;
pub mod message;
pub mod transport;

pub use log::MessageLog;
pub use machine::{Action, ConnectionMachine, ConnectionState};
pub use message::ApplicationMessage;
pub use transport::{ConnectionId, Connector, TransportEvent, TransportHandle, WsConnector};

use thiserror::Error;

/// Errors raised by the chat layer.
///
/// None of these cross the client facade: transport failures become
/// connection state changes and decode failures drop the frame.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported URL scheme '{0}' (expected http, https, ws or wss)")]
    UnsupportedScheme(String),

    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("status request failed: {0}")]
    Status(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}
