/// Reasons a connection must be closed instead of returned to its pool.
///
/// Accumulated over the request/response cycle. Any single reason is enough
/// to disqualify the connection from reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// HTTP/1.0 requires each request-response to end with a close.
    Http10,

    /// Client sent `connection: close`.
    ClientConnectionClose,

    /// Server sent `connection: close`.
    ServerConnectionClose,

    /// The server produced a response before the request body was fully
    /// written.
    ///
    /// The response itself may be perfectly valid (a 4xx rejecting the
    /// upload is common), but the stream still carries unread request body
    /// expectations on the server side, so the connection cannot be reused.
    EarlyResponse,

    /// Response body is close delimited.
    ///
    /// We do not know how much body data to receive. The socket will be
    /// closed when it's done. This is HTTP/1.0 semantics.
    CloseDelimitedBody,
}

impl CloseReason {
    pub(crate) fn explain(&self) -> &'static str {
        match self {
            CloseReason::Http10 => "version is http1.0",
            CloseReason::ClientConnectionClose => "client sent Connection: close",
            CloseReason::ServerConnectionClose => "server sent Connection: close",
            CloseReason::EarlyResponse => "response arrived before request body was sent",
            CloseReason::CloseDelimitedBody => "response body is close delimited",
        }
    }
}
