//! Error handling for the capillary client.

use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum OurError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Image encoding errors
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// WebSocket transport errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Camera errors
    #[error("Camera error: {0}")]
    Camera(String),

    /// The control channel is not open
    #[error("No connection to the device")]
    NotConnected,

    /// Inbound device message could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The clinical API answered with a failure status
    #[error("{message}")]
    Api { status: u16, message: String },

    /// Generic application errors
    #[error("Application error: {0}")]
    App(String),
}

/// Application result type
pub type OurResult<T> = std::result::Result<T, OurError>;
