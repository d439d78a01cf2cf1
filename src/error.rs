use thiserror::Error;

/// Errors surfaced by data-path operations on channels and packet streams.
///
/// NB: None of these are retried by the engine itself - it is the caller's decision how to react
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The channel is closed or aborted, or the engine / packet stream was stopped
    #[error("peer closed")]
    PeerClosed,
    #[error("timeout")]
    Timeout,
    /// The message needs more packets than fit into one window
    #[error("message of {len} bytes needs {num_fragments} packets, window size is {window_size}")]
    MessageTooLarge {
        len: usize,
        num_fragments: usize,
        window_size: u16,
    },
    #[error("packet pool exhausted")]
    ResourceExhausted,
    /// Failure of the underlying socket, e.g. a short write or an unreachable peer
    #[error("transport fault: {0}")]
    TransportFault(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::TransportFault(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
