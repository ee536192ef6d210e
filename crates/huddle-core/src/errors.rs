/// Failures at the wire boundary. Never forwarded to the peer; the
/// transport logs them and drops the frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("undecodable frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode outbound message: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidUtf8(_) => "invalid_utf8",
            Self::Decode(_) => "decode",
            Self::Encode(_) => "encode",
        }
    }
}
