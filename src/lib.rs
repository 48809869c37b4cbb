//! Blocking, pooled, retry-aware HTTP/1.1 request engine.
//!
//! poolreq is the core of a user-level HTTP client: it makes HTTP/1.1
//! requests over plain TCP or TLS, reuses sockets across requests to the
//! same origin, negotiates CONNECT tunnels through forward proxies,
//! drives automatic retry and redirect policies, and delivers streaming
//! response bodies with transparent decoding of the standard content
//! encodings.
//!
//! The request lifecycle:
//!
//! ```text
//!                ┌──────────────────┐
//!                │   PoolManager    │  route, pool key, LRU of pools
//!                └──────────────────┘
//!                          │ lease
//!                          ▼
//!                ┌──────────────────┐
//!                │  per-origin Pool │  LIFO idle stack, health check
//!                └──────────────────┘
//!                          │ connection
//!                          ▼
//!                ┌──────────────────┐
//!     ┌──retry──▶│    Connection    │  connect / tunnel / send / head
//!     │          └──────────────────┘
//!     │                    │ head
//!     │                    ▼
//!     │          ┌──────────────────┐
//!     └──────────│     Response     │  lazy body, decode, release
//!                └──────────────────┘
//! ```
//!
//! The retry controller wraps the manager: failed attempts, retryable
//! statuses and redirects consume budget from an immutable [`Retry`]
//! value, and exhaustion surfaces as [`Error::MaxRetries`] with the full
//! attempt history.
//!
//! # Example
//!
//! ```no_run
//! use poolreq::http::Method;
//! use poolreq::{Body, PoolManager, RequestOptions};
//!
//! # fn main() -> Result<(), poolreq::Error> {
//! let manager = PoolManager::builder()
//!     .num_pools(10)
//!     .maxsize(4)
//!     .build();
//!
//! let response = manager.request(Method::GET, "http://example.test/data")?;
//! assert_eq!(response.status(), 200);
//! let body = response.body().unwrap_or_default().to_vec();
//!
//! // Same origin: the second request reuses the pooled connection.
//! let posted = manager.urlopen(
//!     Method::POST,
//!     "http://example.test/submit",
//!     Body::bytes("payload"),
//!     RequestOptions::default(),
//! )?;
//! # drop((body, posted));
//! # Ok(())
//! # }
//! ```
//!
//! # In scope
//!
//! * HTTP/1.1 over a blocking, thread-safe byte-stream abstraction
//! * Per-origin connection pooling with an LRU-bounded pool manager
//! * Forward proxying and CONNECT tunneling
//! * Retry/redirect policies with backoff and `Retry-After`
//! * Streaming bodies, chunked framing, layered content decoding
//!
//! # Out of scope
//!
//! * TLS primitives: bring a [`TlsProvider`]
//! * DNS: bring a [`Resolver`] (a `getaddrinfo` default is included)
//! * Cookies, auth flows, caching, HTTP/2 and beyond

#[macro_use]
extern crate log;

mod body;
mod close_reason;
mod conn;
mod decode;
mod error;
mod ext;
mod parser;
mod pool;
mod request;
mod response;
mod retry;
mod timeout;
mod transport;
mod url;
mod util;

pub use crate::body::BodyMode;
pub use crate::close_reason::CloseReason;
pub use crate::conn::{ConnConfig, Connection, HostPort, Scheme, MAX_RESPONSE_HEADERS};
pub use crate::error::{Error, MaxRetries};
pub use crate::pool::{
    default_manager, set_default_manager, ManagerBuilder, Pool, PoolConfig, PoolKey, PoolManager,
    PoolStats, ProxyConfig, RequestOptions, TlsKey,
};
pub use crate::request::Body;
pub use crate::response::{BodyChunks, ConnectionInfo, Lines, Response};
pub use crate::retry::{
    Retry, RetryEvent, RetryHistory, DEFAULT_BACKOFF_MAX, RETRY_AFTER_STATUS_CODES,
};
pub use crate::timeout::{Deadline, Timeout};
pub use crate::transport::{
    FamilyPref, GaiResolver, IdleProbe, Resolver, TcpTransport, TlsConfig, TlsProvider, TlsSetup,
    TlsVersion, Transport, VerifyMode,
};

/// Re-export of the `http` crate whose types appear throughout the API.
pub use ::http;

/// Re-export of the URL type used by requests and responses.
pub use ::url::Url;
