//! Error handling business logic of `wishmesh`.
//!
//! Contains the `ErrorKind` enum, mirrored against the numeric RPC error
//! codes handed back to callers, as well as extensions of the standard
//! library's `Result` type used to wrap errors in our own `Error` type.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// Extension of the standard library's `Result` type,
/// used to wrap its error in a `wishmesh::error::Error`.
pub trait ResultWrappedExt {
    type T;

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
}

/// Extension of the standard library's `Result` type.
///
/// Different from `ResultWrappedExt`, this trait is used in cases where
/// we want to drop the underlying error type, e.g. when it doesn't
/// implement `Send`, or we simply have nothing more useful to report
/// than a static message.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|_| Error::wrapped(kind, msg.to_owned()))
    }
}

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The error type used throughout this crate.
pub struct Error {
    inner: ErrorInner,
}

enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(f, "Error::Simple({:?})", k),
            ErrorInner::Wrapped(k, e) => write!(f, "Error::Wrapped({:?}, {})", k, e),
        }
    }
}

impl Error {
    /// Returns an error not wrapping another error implementation,
    /// with kind `ErrorKind`.
    pub fn simple(kind: ErrorKind) -> Self {
        Error {
            inner: ErrorInner::Simple(kind),
        }
    }

    /// Wraps an arbitrary error in an `Error`, with kind `ErrorKind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Error {
            inner: ErrorInner::Wrapped(kind, e.into()),
        }
    }

    /// Returns a copy of the `ErrorKind` of this `Error`.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Wrapped(k, _) => *k,
        }
    }

    /// Swaps the `ErrorKind` carried by this `Error`, keeping any wrapped
    /// source error intact.
    pub fn swap_kind(self, k: ErrorKind) -> Self {
        let inner = match self.inner {
            ErrorInner::Simple(_) => ErrorInner::Simple(k),
            ErrorInner::Wrapped(_, e) => ErrorInner::Wrapped(k, e),
        };
        Error { inner }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(f, "{:?}", k),
            ErrorInner::Wrapped(k, e) => write!(f, "{:?}: {}", k, e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::wrapped(ErrorKind::Io, e)
    }
}

impl error::Error for Error {}

/// The closed set of error kinds surfaced by this crate.
///
/// Each variant documents the numeric RPC error code it is reported under
/// when it crosses the app↔core or core↔core wire (see `ErrorKind::code`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// Generic I/O failure from the transport or storage layer.
    Io,
    /// A document codec operation (get/build) failed or overflowed.
    Codec,
    /// A document field was missing, had the wrong type, or the wrong length.
    ArgumentShape,
    /// A requested uid, connection, or discovery entry does not exist.
    NotFound,
    /// A uid collides with one already present in the identity store.
    Duplicate,
    /// The identity store has reached its configured capacity.
    TooManyIdentities,
    /// The connection pool has reached its configured capacity.
    PoolFull,
    /// The RPC server's request context pool has reached its capacity.
    RequestPoolFull,
    /// An identity has no private key (it is a contact, not a local identity).
    NoPrivateKey,
    /// Writing an RPC reply overflowed the configured buffer.
    ReplyOverflow,
    /// No handler is registered for the requested op.
    UnknownOp,
    /// No connection or transport path exists to the requested peer.
    Unreachable,
    /// A frame declared a length larger than the receive ring.
    FrameTooLarge,
    /// The protocol state machine received an event that is invalid for
    /// its current phase.
    InvalidPhase,
    /// Ed25519 signature verification or parsing failed.
    Crypto,
    /// The on-disk identity blob is corrupt or exceeds the size cap.
    CorruptStore,
    /// Malformed or out-of-range configuration.
    Config,
}

impl ErrorKind {
    /// Returns the numeric RPC error code associated with this kind, as
    /// used in `{err: id, data: {code, msg}}` envelopes.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::ArgumentShape => 501,
            ErrorKind::NotFound => 509,
            ErrorKind::Duplicate => 202,
            ErrorKind::TooManyIdentities => 201,
            ErrorKind::PoolFull => 203,
            ErrorKind::RequestPoolFull => 204,
            ErrorKind::NoPrivateKey => 345,
            ErrorKind::ReplyOverflow => 344,
            ErrorKind::UnknownOp => 404,
            ErrorKind::Unreachable => 506,
            ErrorKind::FrameTooLarge => 507,
            ErrorKind::InvalidPhase => 508,
            ErrorKind::Crypto => 346,
            ErrorKind::CorruptStore => 343,
            ErrorKind::Config => 305,
            ErrorKind::Codec => 303,
            ErrorKind::Io => 304,
        }
    }
}
