//! Error types for the reload engine.
//!
//! A not-modified response is deliberately absent here: it is a successful
//! [`FetchOutcome`](crate::source::FetchOutcome), not a failure.

/// Everything that can stop a feed reload or a queued task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReloadError {
    /// The run was cancelled or the application is shutting down.
    #[error("cancelled")]
    Cancelled,

    /// The feed answered with an authentication challenge for `realm`.
    #[error("authentication required{}", realm_suffix(.realm))]
    AuthenticationRequired { realm: Option<String> },

    /// The feed was downloaded but could not be interpreted.
    #[error("unable to parse feed: {0}")]
    Parse(String),

    /// The feed could not be downloaded.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A task body failed unexpectedly (error status or panic).
    #[error("task failed: {0}")]
    InternalTaskFailure(String),
}

impl ReloadError {
    /// Short human-readable message stored on a subscription's error flag.
    pub fn short_message(&self) -> String {
        match self {
            Self::Parse(_) => "Unable to parse the feed".to_string(),
            Self::Connection(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

fn realm_suffix(realm: &Option<String>) -> String {
    match realm {
        Some(r) => format!(" (realm \"{r}\")"),
        None => String::new(),
    }
}
