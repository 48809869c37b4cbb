//! One connection to one peer.
//!
//! A [`Connection`] owns a [`Transport`] and drives the sans-IO codec over
//! it: prelude and body writing on the way out, incremental head parsing
//! and body deframing on the way in. It tracks everything the pool needs
//! to decide reuse: lifecycle state, unread bytes, accumulated close
//! reasons and the idle health probe.
//!
//! ```text
//! NEW ──connect()──▶ IDLE ──send_request()──▶ REQUEST_SENT
//!                     ▲                             │
//!                     │                    read_response_head()
//!                 body fully read                   │
//!                     │                             ▼
//!                     └──────────────────── RESPONSE_HEAD
//!
//! any ──close()/error──▶ CLOSED (terminal)
//! ```
//!
//! A connection is only returned to its pool in `IDLE` with no close
//! reason recorded and no unread bytes on the stream.

use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use http::{header, HeaderMap, Method, Response, StatusCode, Version};
use url::Url;

use crate::body::{BodyMode, BodyReader};
use crate::close_reason::CloseReason;
use crate::ext::{HeaderMapExt, UrlExt};
use crate::parser::try_parse_response;
use crate::request::PreparedRequest;
use crate::timeout::Deadline;
use crate::transport::{
    connect_tcp, FamilyPref, GaiResolver, IdleProbe, Resolver, TcpTransport, TlsSetup, Transport,
    VerifyMode,
};
use crate::util::{ArrayVec, RecvBuf, Writer};
use crate::Error;

/// Max number of headers to parse from an HTTP response.
pub const MAX_RESPONSE_HEADERS: usize = 128;

/// Scheme of an origin. Only http and https reach the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub(crate) fn from_url(url: &Url) -> Result<Scheme, Error> {
        match url.scheme() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(Error::InvalidUrl(format!("unsupported scheme: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// The peer a connection goes to: the origin, or the proxy in front of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub(crate) fn from_url(url: &Url) -> Result<HostPort, Error> {
        let scheme = Scheme::from_url(url)?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidUrl(format!("no host in {}", url)))?;
        Ok(HostPort {
            scheme,
            host: host.to_string(),
            port: url.port_or_default(),
        })
    }

    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// CONNECT tunnel target, set before `connect()`.
#[derive(Debug, Clone)]
pub(crate) struct TunnelTarget {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    pub headers: HeaderMap,
}

impl TunnelTarget {
    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection behavior knobs, shared by every connection of a manager.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub resolver: Arc<dyn Resolver>,
    pub family: FamilyPref,
    pub tls: Option<TlsSetup>,
    /// Aggregate cap on response head bytes.
    pub max_header_size: usize,
    /// Cap on a single chunk in a chunked response body.
    pub max_chunk_size: u64,
    /// Staging buffer size for socket reads and writes.
    pub buf_size: usize,
    pub tcp_nodelay: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        ConnConfig {
            resolver: Arc::new(GaiResolver),
            family: FamilyPref::Any,
            tls: None,
            max_header_size: 64 * 1024,
            max_chunk_size: 16 * 1024 * 1024,
            buf_size: 16 * 1024,
            tcp_nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Idle,
    RequestSent,
    ResponseHead,
    Closed,
}

/// A single pooled connection.
pub struct Connection {
    target: HostPort,
    tunnel: Option<TunnelTarget>,
    transport: Option<Box<dyn Transport>>,
    state: State,
    recv_buf: RecvBuf,
    reader: Option<BodyReader>,
    trailers: Option<HeaderMap>,
    close_reason: ArrayVec<CloseReason, 4>,
    last_method: Option<Method>,
    created_at: Instant,
    last_used_at: Instant,
    is_verified: bool,
    proxy_is_verified: bool,
    config: Arc<ConnConfig>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connection<{}://{} {:?}>",
            self.target.scheme.as_str(),
            self.target.authority(),
            self.state
        )
    }
}

impl Connection {
    pub(crate) fn new(target: HostPort, config: Arc<ConnConfig>) -> Connection {
        let now = Instant::now();
        Connection {
            target,
            tunnel: None,
            transport: None,
            state: State::New,
            recv_buf: RecvBuf::new(),
            reader: None,
            trailers: None,
            close_reason: ArrayVec::from_fn(|_| CloseReason::Http10),
            last_method: None,
            created_at: now,
            last_used_at: now,
            is_verified: false,
            proxy_is_verified: false,
            config,
        }
    }

    /// Mark this connection as a CONNECT tunnel to `host:port`.
    ///
    /// Must be called before [`Connection::connect`].
    pub(crate) fn set_tunnel(
        &mut self,
        host: String,
        port: u16,
        scheme: Scheme,
        headers: HeaderMap,
    ) -> Result<(), Error> {
        if self.state != State::New {
            return Err(Error::IllegalState("set_tunnel after connect"));
        }
        self.tunnel = Some(TunnelTarget {
            host,
            port,
            scheme,
            headers,
        });
        Ok(())
    }

    /// Resolve, connect, optionally tunnel, optionally handshake.
    pub(crate) fn connect(&mut self, deadline: &Deadline) -> Result<(), Error> {
        if self.state != State::New {
            return Err(Error::IllegalState("connect on established connection"));
        }

        let addrs = self.config.resolver.resolve(
            &self.target.host,
            self.target.port,
            self.config.family,
        )?;
        let tcp = connect_tcp(&addrs, deadline.connect_timeout()?, self.config.tcp_nodelay)?;
        let mut t: Box<dyn Transport> = Box::new(TcpTransport::new(tcp)?);

        // TLS hop to the immediate peer: the origin when direct, the proxy
        // itself when the proxy URL is https.
        if self.target.scheme == Scheme::Https {
            let host = self.target.host.clone();
            let is_proxy_hop = self.tunnel.is_some();
            t = self.wrap_tls(t, &host, !is_proxy_hop)?;
            if is_proxy_hop {
                self.proxy_is_verified = t.is_verified();
            } else {
                self.is_verified = t.is_verified();
            }
        }

        if let Some(tunnel) = self.tunnel.clone() {
            self.exchange_connect(&mut t, &tunnel, deadline)?;
            if tunnel.scheme == Scheme::Https {
                t = self.wrap_tls(t, &tunnel.host, true)?;
                self.is_verified = t.is_verified();
            }
        }

        self.transport = Some(t);
        self.state = State::Idle;
        debug!("{:?}", self);
        Ok(())
    }

    fn wrap_tls(
        &self,
        inner: Box<dyn Transport>,
        host: &str,
        origin_hop: bool,
    ) -> Result<Box<dyn Transport>, Error> {
        let setup = self
            .config
            .tls
            .as_ref()
            .ok_or_else(|| Error::Tls("no tls provider configured".into()))?;

        if setup.config.verify == VerifyMode::Disabled {
            warn!(
                "TLS certificate verification is disabled for https://{}",
                host
            );
        }

        // The SNI override only applies to the origin handshake, never to
        // the proxy hop.
        let sni = if origin_hop {
            setup.hostname(host)
        } else {
            host
        };

        setup
            .provider
            .wrap(inner, sni, Some(&["http/1.1"]), &setup.config)
    }

    /// Send `CONNECT` and require a 2xx before the tunnel exists.
    fn exchange_connect(
        &mut self,
        t: &mut Box<dyn Transport>,
        tunnel: &TunnelTarget,
        deadline: &Deadline,
    ) -> Result<(), Error> {
        let authority = tunnel.authority();
        let mut preamble = Vec::with_capacity(256);
        write!(preamble, "CONNECT {} HTTP/1.1\r\n", authority).expect("write to vec");
        write!(preamble, "Host: {}\r\n", authority).expect("write to vec");
        for (name, value) in &tunnel.headers {
            preamble.extend_from_slice(name.as_str().as_bytes());
            preamble.extend_from_slice(b": ");
            preamble.extend_from_slice(value.as_bytes());
            preamble.extend_from_slice(b"\r\n");
        }
        preamble.extend_from_slice(b"\r\n");

        t.write_all(&preamble, deadline.connect_timeout()?)?;

        let response = loop {
            match try_parse_response::<MAX_RESPONSE_HEADERS>(self.recv_buf.unconsumed())? {
                Some((used, response)) => {
                    self.recv_buf.consume(used);
                    break response;
                }
                None => {
                    if self.recv_buf.len() > self.config.max_header_size {
                        return Err(Error::HeaderOverflow);
                    }
                    let timeout = deadline.connect_timeout()?;
                    let n = self
                        .recv_buf
                        .fill_from(self.config.buf_size, |spare| t.read(spare, timeout))?;
                    if n == 0 {
                        return Err(Error::UnexpectedEof);
                    }
                }
            }
        };

        if !response.status().is_success() {
            t.close();
            return Err(Error::Proxy(response.status()));
        }

        debug!("CONNECT {} established", authority);
        Ok(())
    }

    /// Write the request prelude and body.
    ///
    /// A broken pipe while writing the body is not an error: the server
    /// may have rejected the upload and already produced a response. The
    /// connection is marked non-reusable and the head read proceeds.
    pub(crate) fn send_request(
        &mut self,
        prepared: &mut PreparedRequest,
        deadline: &Deadline,
    ) -> Result<(), Error> {
        if self.state != State::Idle {
            return Err(Error::IllegalState("send_request on busy connection"));
        }

        self.last_method = Some(prepared.method().clone());
        let mut buf = vec![0u8; self.config.buf_size];

        loop {
            let mut w = Writer::new(&mut buf);
            let done = prepared.write_prelude(&mut w)?;
            let n = w.len();
            let timeout = deadline.read_timeout()?;
            let t = self.transport_mut()?;
            t.write_all(&buf[..n], timeout)?;
            if done {
                break;
            }
        }

        let mut peer_hung_up = false;
        while !prepared.body_fully_sent() {
            let n = prepared.next_body_chunk(&mut buf)?;
            if n == 0 {
                break;
            }
            let timeout = deadline.read_timeout()?;
            let t = self.transport_mut()?;
            match t.write_all(&buf[..n], timeout) {
                Ok(()) => {}
                Err(Error::Io(e)) if is_pipe_error(&e) => {
                    debug!("peer hung up mid-body, expecting early response");
                    peer_hung_up = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if peer_hung_up || !prepared.body_fully_sent() {
            self.close_reason.push(CloseReason::EarlyResponse);
        }

        self.state = State::RequestSent;
        debug!("{:?}", self);
        Ok(())
    }

    /// Read and parse the response head.
    ///
    /// Interim `100 Continue` responses are discarded: they can arrive
    /// late when a server answers an `Expect` header after the client
    /// already started the body.
    pub(crate) fn read_response_head(
        &mut self,
        deadline: &Deadline,
    ) -> Result<Response<()>, Error> {
        if self.state != State::RequestSent {
            return Err(Error::IllegalState("read_response_head before send"));
        }

        loop {
            match try_parse_response::<MAX_RESPONSE_HEADERS>(self.recv_buf.unconsumed())? {
                Some((used, response)) => {
                    self.recv_buf.consume(used);

                    if response.status() == StatusCode::CONTINUE {
                        debug!("discarding interim 100 Continue");
                        continue;
                    }

                    self.finish_head(&response)?;
                    return Ok(response);
                }
                None => {
                    if self.recv_buf.len() > self.config.max_header_size {
                        return Err(Error::HeaderOverflow);
                    }
                    let n = self.fill_recv(deadline)?;
                    if n == 0 {
                        return Err(Error::UnexpectedEof);
                    }
                }
            }
        }
    }

    fn finish_head(&mut self, response: &Response<()>) -> Result<(), Error> {
        let http10 = response.version() == Version::HTTP_10;
        if http10 {
            self.close_reason.push(CloseReason::Http10);
        }
        if response.headers().has_token(header::CONNECTION, "close") {
            self.close_reason.push(CloseReason::ServerConnectionClose);
        }

        let method = self.last_method.clone().unwrap_or(Method::GET);
        let reader = BodyReader::for_response(
            http10,
            &method,
            response.status().as_u16(),
            response.headers(),
            self.config.max_chunk_size,
        )?;

        if reader.body_mode() == BodyMode::CloseDelimited {
            self.close_reason.push(CloseReason::CloseDelimitedBody);
        }

        self.trailers = None;
        self.reader = Some(reader);
        self.state = State::ResponseHead;
        debug!("{:?}", self);
        Ok(())
    }

    /// Pull decoded-framing body bytes into `out`. `Ok(0)` is end of body,
    /// at which point the connection is `IDLE` again.
    pub(crate) fn read_body(&mut self, out: &mut [u8], deadline: &Deadline) -> Result<usize, Error> {
        if self.state == State::Idle {
            return Ok(0);
        }
        if self.state != State::ResponseHead {
            return Err(Error::IllegalState("read_body without response"));
        }
        if out.is_empty() {
            return Ok(0);
        }

        loop {
            let ended = {
                let reader = self.reader.as_mut().expect("reader in ResponseHead");
                if !self.recv_buf.is_empty() {
                    let (iu, ou) = reader.read(self.recv_buf.unconsumed(), out)?;
                    self.recv_buf.consume(iu);
                    if ou > 0 {
                        return Ok(ou);
                    }
                }
                reader.is_ended()
            };

            if ended {
                self.finish_body();
                return Ok(0);
            }

            let n = self.fill_recv(deadline)?;
            if n == 0 {
                let reader = self.reader.as_mut().expect("reader in ResponseHead");
                reader.input_ended()?;
                // Close delimited bodies end at EOF; anything else errored
                // in input_ended above.
            }
        }
    }

    fn finish_body(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            self.trailers = reader.take_trailers();
        }
        self.reader = None;
        self.state = State::Idle;
        self.last_used_at = Instant::now();
        debug!("{:?}", self);
    }

    /// Trailer headers of the last response, after its body completed.
    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }

    fn fill_recv(&mut self, deadline: &Deadline) -> Result<usize, Error> {
        let timeout = deadline.read_timeout()?;
        let buf_size = self.config.buf_size;
        let t = self
            .transport
            .as_mut()
            .ok_or(Error::IllegalState("read on closed connection"))?;
        self.recv_buf.fill_from(buf_size, |spare| t.read(spare, timeout))
    }

    fn transport_mut(&mut self) -> Result<&mut Box<dyn Transport>, Error> {
        self.transport
            .as_mut()
            .ok_or(Error::IllegalState("connection is closed"))
    }

    /// Close the connection. Idempotent; a closed connection is never
    /// reused.
    pub fn close(&mut self) {
        if let Some(mut t) = self.transport.take() {
            t.close();
        }
        if self.state != State::Closed {
            self.state = State::Closed;
            debug!("{:?}", self);
        }
    }

    /// Whether the connection can go back to its pool.
    pub(crate) fn is_reusable(&self) -> bool {
        self.state == State::Idle
            && self.close_reason.is_empty()
            && self.recv_buf.is_empty()
            && self.transport.is_some()
    }

    /// Reuse gate for a connection popped from the idle stack: state
    /// checks plus the non-blocking peek for a peer that went away.
    pub(crate) fn health_check(&mut self) -> bool {
        if !self.is_reusable() {
            return false;
        }
        match self.transport.as_mut().map(|t| t.probe_idle()) {
            Some(IdleProbe::Healthy) => true,
            Some(probe) => {
                debug!("idle probe failed ({:?}): {:?}", probe, self);
                false
            }
            None => false,
        }
    }

    /// Why this connection cannot be reused, if it cannot.
    pub fn close_reason(&self) -> Option<&'static str> {
        self.close_reason.first().map(|r| r.explain())
    }

    pub(crate) fn is_unconnected(&self) -> bool {
        self.state == State::New
    }

    pub fn has_tunnel(&self) -> bool {
        self.tunnel.is_some()
    }

    /// Whether the origin hop presented a verified certificate.
    pub fn is_verified(&self) -> bool {
        self.is_verified
    }

    /// Whether the proxy hop presented a verified certificate.
    pub fn proxy_is_verified(&self) -> bool {
        self.proxy_is_verified
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().and_then(|t| t.peer_addr())
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    #[cfg(test)]
    pub(crate) fn for_test(target: HostPort, transport: Box<dyn Transport>) -> Connection {
        let mut conn = Connection::new(target, Arc::new(ConnConfig::default()));
        conn.transport = Some(transport);
        conn.state = State::Idle;
        conn
    }

    #[cfg(test)]
    pub(crate) fn for_test_tunneled(
        target: HostPort,
        tunnel: (String, u16, Scheme),
    ) -> Connection {
        let mut conn = Connection::new(target, Arc::new(ConnConfig::default()));
        conn.set_tunnel(tunnel.0, tunnel.1, tunnel.2, HeaderMap::new())
            .unwrap();
        conn
    }
}

fn is_pipe_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
    )
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// What the scripted transport does on the next read.
    #[derive(Debug)]
    pub enum Step {
        /// Serve these bytes across one or more reads.
        Recv(Vec<u8>),
        /// Report EOF.
        Eof,
        /// Fail the read as a timeout.
        TimeOut,
    }

    /// In-memory transport driven by a script, capturing written bytes.
    #[derive(Debug)]
    pub struct ScriptedTransport {
        script: VecDeque<Step>,
        pending: Vec<u8>,
        pub written: Arc<Mutex<Vec<u8>>>,
        /// Writes accepted before the pipe breaks. `None` never breaks.
        writes_before_break: Option<usize>,
        closed: bool,
        verified: bool,
    }

    impl ScriptedTransport {
        pub fn new(script: Vec<Step>) -> ScriptedTransport {
            ScriptedTransport {
                script: script.into(),
                pending: Vec::new(),
                written: Arc::new(Mutex::new(Vec::new())),
                writes_before_break: None,
                closed: false,
                verified: false,
            }
        }

        /// Accept `n` writes, then fail every write with a broken pipe.
        pub fn break_pipe_after(mut self, n: usize) -> ScriptedTransport {
            self.writes_before_break = Some(n);
            self
        }

        pub fn written_handle(&self) -> Arc<Mutex<Vec<u8>>> {
            self.written.clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn read(&mut self, buf: &mut [u8], _timeout: Option<Duration>) -> Result<usize, Error> {
            loop {
                if !self.pending.is_empty() {
                    let n = self.pending.len().min(buf.len());
                    buf[..n].copy_from_slice(&self.pending[..n]);
                    self.pending.drain(..n);
                    return Ok(n);
                }
                match self.script.pop_front() {
                    Some(Step::Recv(data)) => self.pending = data,
                    Some(Step::Eof) | None => return Ok(0),
                    Some(Step::TimeOut) => return Err(Error::ReadTimeout),
                }
            }
        }

        fn write_all(&mut self, buf: &[u8], _timeout: Option<Duration>) -> Result<(), Error> {
            match &mut self.writes_before_break {
                Some(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "broken pipe",
                    )));
                }
                Some(n) => *n -= 1,
                None => {}
            }
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn probe_idle(&mut self) -> IdleProbe {
            if self.closed {
                return IdleProbe::Failed;
            }
            match self.script.front() {
                Some(Step::Eof) => IdleProbe::Eof,
                Some(Step::Recv(_)) => IdleProbe::PendingBytes,
                _ => IdleProbe::Healthy,
            }
        }

        fn is_verified(&self) -> bool {
            self.verified
        }
    }

    pub fn host(scheme: Scheme, host: &str, port: u16) -> HostPort {
        HostPort {
            scheme,
            host: host.into(),
            port,
        }
    }
}
