use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

/// Messages that mean the browser session is gone for good.
const CLOSED_SIGNATURES: [&str; 5] = [
    "Target page, context or browser has been closed",
    "Session closed",
    "browser has been closed",
    "invalid session id",
    "no such window",
];

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("webdriver transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("webdriver {status} {error}: {message}")]
    WebDriver {
        status: u16,
        error: String,
        message: String,
    },
    #[error("script failed: {0}")]
    Script(String),
    #[error("unexpected webdriver reply: {0}")]
    Protocol(String),
    #[error("Session closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PageError {
    pub fn is_session_closed(&self) -> bool {
        match self {
            Self::Closed => true,
            other => is_closed_message(&other.to_string()),
        }
    }
}

pub fn is_closed_message(msg: &str) -> bool {
    CLOSED_SIGNATURES.iter().any(|sig| msg.contains(sig))
}

/// Closed-session check for errors that went through `anyhow`.
pub fn is_closed_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| match cause.downcast_ref::<PageError>() {
        Some(page_err) => page_err.is_session_closed(),
        None => is_closed_message(&cause.to_string()),
    })
}

/// The one browser tab the bot drives.
///
/// Operations are awaited one at a time; nothing in the crate issues two
/// page calls concurrently.
#[async_trait]
pub trait Page: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), PageError>;

    /// Runs a function body against the current document. `args` are exposed
    /// as `arguments[0..]`; the body's `return` value comes back as JSON.
    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value, PageError>;

    async fn wait_for_timeout(&self, ms: u64);

    fn is_closed(&self) -> bool;

    async fn screenshot(&self, path: &Path) -> Result<(), PageError>;
}
