use std::fmt;
use std::io;

use http::StatusCode;

use crate::retry::RetryHistory;

/// Error type for poolreq.
#[derive(Debug)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum Error {
    /// The URL could not be used for a request. Empty host, unsupported
    /// scheme or malformed syntax.
    InvalidUrl(String),

    BadHeader(String),
    HeaderOverflow,
    HttpParseFail(String),
    HttpParseTooManyHeaders,
    MissingResponseVersion,
    ResponseInvalidStatus,
    ChunkLenNotAscii,
    ChunkLenNotANumber,
    ChunkExpectedCrLf,
    ChunkTooLarge,
    BodyContentAfterFinish,
    BodyLargerThanContentLength,
    BodyShorterThanContentLength,
    BodyLengthRequired,
    OutputOverflow,

    /// The peer closed the connection in the middle of a message.
    UnexpectedEof,

    /// An operation was attempted in a connection state that does not
    /// allow it.
    IllegalState(&'static str),

    NoLocationHeader,
    BadLocationHeader(String),

    /// DNS resolution produced no usable address.
    Resolve(String),

    /// TCP level connection failure.
    Connect(io::Error),

    /// The connect phase exceeded its time budget.
    ConnectTimeout,

    /// A read exceeded its time budget, or the total request budget ran out.
    ReadTimeout,

    /// I/O failure on an established connection.
    Io(io::Error),

    /// TLS handshake or verification failure. Not retried.
    Tls(String),

    /// The proxy refused the CONNECT request.
    Proxy(StatusCode),

    /// The pool was shut down while waiting for a connection.
    PoolShutdown,

    /// `block=true` and no connection was freed before the lease timeout.
    EmptyPool,

    /// Unknown or broken `Content-Encoding` payload.
    ContentDecoding(String),

    /// Decoded body exceeded the configured `decode_max_bytes`.
    DecodeOverflow,

    /// More chained `Content-Encoding` tokens than the configured cap.
    TooManyEncodings,

    /// The retry budget is exhausted. Wraps the last failure and the
    /// accumulated attempt history.
    MaxRetries(Box<MaxRetries>),
}

/// Details for [`Error::MaxRetries`].
#[derive(Debug)]
pub struct MaxRetries {
    /// The URL of the final attempt.
    pub url: String,
    /// Human readable summary of the last error or response.
    pub reason: String,
    /// One event per attempt that was made.
    pub history: RetryHistory,
}

impl Error {
    pub(crate) fn max_retries(url: String, reason: String, history: RetryHistory) -> Error {
        Error::MaxRetries(Box::new(MaxRetries {
            url,
            reason,
            history,
        }))
    }

    /// True for failures in the connect phase: DNS, TCP or connect timeout.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            Error::Resolve(_) | Error::Connect(_) | Error::ConnectTimeout
        )
    }

    /// True for failures while reading a response on an established
    /// connection. Retried only for idempotent methods.
    pub fn is_read_error(&self) -> bool {
        matches!(
            self,
            Error::ReadTimeout
                | Error::UnexpectedEof
                | Error::HttpParseFail(_)
                | Error::HttpParseTooManyHeaders
                | Error::MissingResponseVersion
                | Error::ResponseInvalidStatus
                | Error::HeaderOverflow
                | Error::ChunkLenNotAscii
                | Error::ChunkLenNotANumber
                | Error::ChunkExpectedCrLf
                | Error::ChunkTooLarge
        )
    }

    /// True for timeouts of either phase.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ConnectTimeout | Error::ReadTimeout)
    }

    /// Errors that bypass the retry controller entirely.
    pub(crate) fn is_never_retried(&self) -> bool {
        matches!(
            self,
            Error::Tls(_)
                | Error::InvalidUrl(_)
                | Error::EmptyPool
                | Error::PoolShutdown
                | Error::ContentDecoding(_)
                | Error::DecodeOverflow
                | Error::TooManyEncodings
                | Error::MaxRetries(_)
                | Error::IllegalState(_)
                | Error::BodyLengthRequired
        )
    }

    /// Convert to an `io::Error` for use behind `std::io::Read`.
    ///
    /// The original error is carried as the source and can be recovered
    /// with [`Error::from_io`].
    pub(crate) fn into_io(self) -> io::Error {
        let kind = match &self {
            Error::ReadTimeout | Error::ConnectTimeout => io::ErrorKind::TimedOut,
            Error::UnexpectedEof => io::ErrorKind::UnexpectedEof,
            Error::Io(e) | Error::Connect(e) => e.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// Recover an [`Error`] previously wrapped by [`Error::into_io`], or
    /// classify a foreign `io::Error`.
    pub(crate) fn from_io(e: io::Error) -> Error {
        if e.get_ref().map(|inner| inner.is::<Error>()).unwrap_or(false) {
            let inner = e.into_inner().unwrap();
            return *inner.downcast::<Error>().unwrap();
        }
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::ReadTimeout,
            io::ErrorKind::UnexpectedEof => Error::UnexpectedEof,
            _ => Error::Io(e),
        }
    }
}

impl From<httparse::Error> for Error {
    fn from(value: httparse::Error) -> Self {
        if value == httparse::Error::TooManyHeaders {
            Error::HttpParseTooManyHeaders
        } else {
            Error::HttpParseFail(value.to_string())
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connect(e) | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidUrl(v) => write!(f, "invalid url: {}", v),
            Error::BadHeader(v) => write!(f, "bad header: {}", v),
            Error::HeaderOverflow => write!(f, "response headers exceed the configured maximum"),
            Error::HttpParseFail(v) => write!(f, "http parse fail: {}", v),
            Error::HttpParseTooManyHeaders => write!(f, "http parse resulted in too many headers"),
            Error::MissingResponseVersion => write!(f, "http response missing version"),
            Error::ResponseInvalidStatus => write!(f, "http response invalid status"),
            Error::ChunkLenNotAscii => write!(f, "chunk length is not ascii"),
            Error::ChunkLenNotANumber => write!(f, "chunk length cannot be read as a number"),
            Error::ChunkExpectedCrLf => write!(f, "chunk expected crlf as next character"),
            Error::ChunkTooLarge => write!(f, "chunk length exceeds the configured maximum"),
            Error::BodyContentAfterFinish => {
                write!(f, "attempt to stream body after sending finish (&[])")
            }
            Error::BodyLargerThanContentLength => {
                write!(f, "attempt to write larger body than content-length")
            }
            Error::BodyShorterThanContentLength => {
                write!(f, "body source ended before content-length was fulfilled")
            }
            Error::BodyLengthRequired => {
                write!(f, "method requires an explicit content-length for this body")
            }
            Error::OutputOverflow => write!(f, "output too small to write output"),
            Error::UnexpectedEof => write!(f, "peer closed connection mid-message"),
            Error::IllegalState(v) => write!(f, "illegal connection state: {}", v),
            Error::NoLocationHeader => write!(f, "missing a location header"),
            Error::BadLocationHeader(v) => write!(f, "location header is malformed: {}", v),
            Error::Resolve(v) => write!(f, "failed to resolve host: {}", v),
            Error::Connect(v) => write!(f, "connection failed: {}", v),
            Error::ConnectTimeout => write!(f, "timeout while connecting"),
            Error::ReadTimeout => write!(f, "timeout while reading"),
            Error::Io(v) => write!(f, "io: {}", v),
            Error::Tls(v) => write!(f, "tls: {}", v),
            Error::Proxy(status) => write!(f, "proxy refused CONNECT: {}", status),
            Error::PoolShutdown => write!(f, "pool is shut down"),
            Error::EmptyPool => write!(f, "no pooled connection available within lease timeout"),
            Error::ContentDecoding(v) => write!(f, "content decoding: {}", v),
            Error::DecodeOverflow => write!(f, "decoded body exceeds configured maximum"),
            Error::TooManyEncodings => write!(f, "too many chained content encodings"),
            Error::MaxRetries(v) => write!(
                f,
                "max retries exceeded for {}: {} ({} attempts)",
                v.url,
                v.reason,
                v.history.len()
            ),
        }
    }
}
