pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that escape synchronously from a call site. Sending timeout,
/// receiving timeout, handshake timeout, and peer-identity conflict are
/// part of the transport's error taxonomy too, but per spec none of
/// them surface as a `Result` error: they resolve into a stream's
/// `Outcome` (see `stream::Outcome`) or, for peer-identity conflict, a
/// silent session shutdown with nothing escaping above the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("output buffer would exceed {limit} bytes (currently {current})")]
    BufferOverflow { current: usize, limit: usize },

    #[error("malformed datagram: {0}")]
    MalformedDatagram(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
