use thiserror::Error;

/// Error taxonomy for the chat engine.
///
/// Transport-level failures are handled internally by the connection
/// manager (backoff, re-join) and only escalate as a connectivity state,
/// never as a crash. Everything here is a per-operation failure reported
/// at the call site.
#[derive(Error, Debug)]
pub enum ChatError {
    /// No credential, or the server rejected it. Fatal for the session;
    /// token refresh is the caller's problem.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The live channel is unavailable and the bounded wait window for a
    /// queued call elapsed. Retryable once the connection recovers.
    #[error("not connected to the messaging server")]
    NotConnected,

    /// A send was accepted locally but rejected by the backend. The
    /// optimistic message stays visible so the user can retry.
    #[error("message dispatch failed: {0}")]
    Dispatch(String),

    /// History page or initial load failed. Local state is unchanged.
    #[error("history fetch failed: {0}")]
    HistoryFetch(String),

    /// A malformed frame or an event for a conversation this client
    /// never joined.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection manager was shut down and can no longer accept
    /// commands.
    #[error("connection is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ChatError>;
