//! Crate-wide error type.
//!
//! Every fatal condition named in the specification — an undecodable message,
//! a broken protocol invariant (a fork double-held, a lost token, a negative
//! reply counter) — is funneled through this one `Error`/`ErrorKind` pair
//! instead of scattered `panic!`s, so the driver can print one diagnostic and
//! exit non-zero.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("failed to encode a message onto the wire")]
    MessageEncode,
    #[error("failed to decode a message off the wire")]
    MessageDecode,
    #[error("a node thread panicked or could not be joined")]
    NodeThreadJoin,
    #[error("the same fork was simultaneously reported held by both endpoints")]
    ForkDoubleHeld,
    #[error("a token went missing from every one of A, B[.] and the locked sets")]
    TokenLost,
    #[error("outstanding-reply counter would have gone negative")]
    OutstandingRepliesUnderflow,
    #[error("the global Control Token's (A, B) partition is inconsistent")]
    ControlTokenInconsistent,
    #[error("two critical-section intervals overlapped")]
    MutualExclusionViolated,
    #[error("a peer's inbox channel was closed while a message was still in flight")]
    ChannelClosed,
    #[error("invalid configuration")]
    InvalidConfig,
}

/// Wraps an [`ErrorKind`] with the foreign error, if any, that triggered it.
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

/// Adapts a foreign `Result` into the crate's own, tagging it with an
/// [`ErrorKind`] the way `febft`'s serializer modules do (`.wrapped(ErrorKind::X)`).
pub trait WrappedResult<T> {
    fn wrapped(self, kind: ErrorKind) -> Result<T>;
}

impl<T, E> WrappedResult<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn wrapped(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|e| Error {
            kind,
            source: Some(Box::new(e)),
        })
    }
}
