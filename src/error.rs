//! Error taxonomy for the p2p core.
//!
//! Transport and protocol failures surface here; application-level failures
//! travel as nonzero result codes inside `P2pResponse` and never as `Err`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("no route to peer {0}")]
    NoRoute(String),

    #[error("request {0} timed out")]
    Timeout(u32),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}
