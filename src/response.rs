//! Streaming response.
//!
//! A [`Response`] owns its leased connection until the body is done. The
//! raw (deframed) byte source releases the connection back to its pool
//! the moment the body completes; content decoders stack on top of that
//! source, so release does not depend on decoder state. Dropping a
//! half-read response closes the connection instead of returning it.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::net::SocketAddr;
use std::sync::Arc;

use http::{header, HeaderMap, StatusCode, Version};
use parking_lot::Mutex;
use url::Url;

use crate::conn::Connection;
use crate::decode::{self, BoxedReader};
use crate::parser::ReasonPhrase;
use crate::pool::PoolHandle;
use crate::retry::Retry;
use crate::timeout::Deadline;
use crate::Error;

/// How much unread raw body `release` drains before giving up and
/// closing the connection instead.
const DRAIN_BUDGET: usize = 64 * 1024;

/// Connection facts observable while the response holds its connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub has_tunnel: bool,
    pub is_verified: bool,
    pub proxy_is_verified: bool,
    pub peer_addr: Option<SocketAddr>,
}

/// The connection and its return path, shared between the response and
/// the raw reader buried under the decoder stack.
struct BodyCore {
    conn: Option<Connection>,
    pool: PoolHandle,
    deadline: Deadline,
    finished: bool,
    trailers: Option<HeaderMap>,
}

impl BodyCore {
    /// Pull deframed body bytes. Releases the connection at end of body.
    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Ok(0),
        };

        let n = match conn.read_body(buf, &self.deadline) {
            Ok(n) => n,
            Err(e) => {
                // Mid-body failure: the connection is poisoned.
                self.close_conn();
                return Err(e);
            }
        };

        if n == 0 {
            self.finish();
        }
        Ok(n)
    }

    /// Body complete: collect trailers and hand the connection back.
    fn finish(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            self.trailers = conn.take_trailers();
            self.pool.release(conn);
        }
        self.finished = true;
    }

    /// Close and return the connection for lease accounting.
    fn close_conn(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
            self.pool.release(conn);
        }
        self.finished = true;
    }

    /// Read the rest of the raw body, bounded. Closes on overrun.
    fn drain(&mut self) {
        let mut scratch = [0u8; 4096];
        let mut drained = 0;
        while self.conn.is_some() {
            match self.read_raw(&mut scratch) {
                Ok(0) => return,
                Ok(n) => {
                    drained += n;
                    if drained > DRAIN_BUDGET {
                        debug!("drain budget exhausted, closing connection");
                        self.close_conn();
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }
}

impl Drop for BodyCore {
    fn drop(&mut self) {
        // Guard path: a half-read response never returns its connection
        // in a reusable state.
        if self.conn.is_some() {
            self.close_conn();
        }
    }
}

/// Raw body source handed to the decoder stack.
struct RawBody {
    core: Arc<Mutex<BodyCore>>,
}

impl Read for RawBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.core.lock().read_raw(buf).map_err(Error::into_io)
    }
}

enum BodySource {
    Stream(BoxedReader),
    Preloaded(io::Cursor<Vec<u8>>),
}

/// An HTTP response with a lazy body.
pub struct Response {
    status: StatusCode,
    version: Version,
    reason: Option<String>,
    headers: HeaderMap,
    url: Url,
    retries: Retry,
    core: Arc<Mutex<BodyCore>>,
    source: BodySource,
}

impl Response {
    pub(crate) fn new(
        head: http::Response<()>,
        conn: Connection,
        pool: PoolHandle,
        deadline: Deadline,
        url: Url,
        decode_content: bool,
        max_encodings: usize,
        decode_max_bytes: Option<u64>,
    ) -> Result<Response, Error> {
        let (parts, ()) = head.into_parts();
        let reason = parts
            .extensions
            .get::<ReasonPhrase>()
            .map(|r| r.as_str().to_string());

        let core = Arc::new(Mutex::new(BodyCore {
            conn: Some(conn),
            pool,
            deadline,
            finished: false,
            trailers: None,
        }));

        let raw: BoxedReader = Box::new(RawBody { core: core.clone() });

        let codings = if decode_content {
            decode::parse_content_encoding(&parts.headers)
        } else {
            Vec::new()
        };

        let reader = match decode::wrap_decoders(raw, &codings, max_encodings, decode_max_bytes) {
            Ok(reader) => reader,
            Err(e) => {
                core.lock().close_conn();
                return Err(e);
            }
        };

        Ok(Response {
            status: parts.status,
            version: parts.version,
            reason,
            headers: parts.headers,
            url,
            retries: Retry::disabled(),
            core,
            source: BodySource::Stream(reader),
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Reason phrase from the status line, when the server sent one.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The URL this response answered. Redirects update it.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Declared `Content-Length`, when present.
    ///
    /// With content decoding active this no longer matches the number of
    /// bytes `read` produces.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok())
    }

    /// The retry state that produced this response, including attempt
    /// history.
    pub fn retries(&self) -> &Retry {
        &self.retries
    }

    pub(crate) fn set_retries(&mut self, retries: Retry) {
        self.retries = retries;
    }

    pub(crate) fn location(&self) -> Option<String> {
        self.headers
            .get_all(header::LOCATION)
            .iter()
            .last()
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Facts about the connection, while this response still holds it.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        let core = self.core.lock();
        core.conn.as_ref().map(|conn| ConnectionInfo {
            has_tunnel: conn.has_tunnel(),
            is_verified: conn.is_verified(),
            proxy_is_verified: conn.proxy_is_verified(),
            peer_addr: conn.peer_addr(),
        })
    }

    /// Trailer headers of a chunked body. Present only after the body
    /// has been read to the end.
    pub fn trailers(&self) -> Option<HeaderMap> {
        self.core.lock().trailers.clone()
    }

    /// Read decoded body bytes.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match &mut self.source {
            BodySource::Stream(r) => r.read(buf).map_err(Error::from_io),
            BodySource::Preloaded(c) => Ok(c.read(buf).expect("cursor read")),
        }
    }

    /// Read with at most one underlying read call.
    pub fn read1(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.read(buf)
    }

    /// Iterate the body in chunks of at most `size` bytes.
    pub fn stream(&mut self, size: usize) -> BodyChunks<'_> {
        BodyChunks {
            response: self,
            size: size.max(1),
        }
    }

    /// Iterate the decoded body line by line.
    pub fn lines(self) -> Lines {
        Lines {
            inner: BufReader::new(self).lines(),
        }
    }

    /// Read the entire body into memory and release the connection.
    ///
    /// Afterwards the body is served from memory and can be re-read via
    /// [`Response::rewind`].
    pub fn preload(&mut self) -> Result<(), Error> {
        if matches!(self.source, BodySource::Preloaded(_)) {
            return Ok(());
        }
        let mut data = Vec::new();
        match &mut self.source {
            BodySource::Stream(r) => {
                if let Err(e) = r.read_to_end(&mut data) {
                    let e = Error::from_io(e);
                    self.core.lock().close_conn();
                    return Err(e);
                }
            }
            BodySource::Preloaded(_) => unreachable!("checked above"),
        }
        self.source = BodySource::Preloaded(io::Cursor::new(data));
        Ok(())
    }

    /// The whole body, when it was preloaded.
    pub fn body(&self) -> Option<&[u8]> {
        match &self.source {
            BodySource::Preloaded(c) => Some(c.get_ref()),
            BodySource::Stream(_) => None,
        }
    }

    /// Restart reading from the beginning. Only possible after
    /// [`Response::preload`].
    pub fn rewind(&mut self) -> Result<(), Error> {
        match &mut self.source {
            BodySource::Preloaded(c) => {
                c.set_position(0);
                Ok(())
            }
            BodySource::Stream(_) => Err(Error::IllegalState(
                "rewind requires a preloaded body",
            )),
        }
    }

    /// Drain the remaining body (bounded) and return the connection to
    /// its pool. Closes instead when the remainder is large.
    pub fn release(&mut self) {
        self.core.lock().drain();
    }

    /// Close the connection without draining. The connection is not
    /// reused.
    pub fn close(&mut self) {
        self.core.lock().close_conn();
    }

    /// True once the body is fully read and the connection given back.
    pub fn is_released(&self) -> bool {
        self.core.lock().finished
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Response<{} {}>", self.status, self.url)
    }
}

impl Read for Response {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Response::read(self, buf).map_err(Error::into_io)
    }
}

/// Iterator over body chunks. See [`Response::stream`].
pub struct BodyChunks<'a> {
    response: &'a mut Response,
    size: usize,
}

impl Iterator for BodyChunks<'_> {
    type Item = Result<Vec<u8>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = vec![0u8; self.size];
        match self.response.read(&mut buf) {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some(Ok(buf))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Iterator over body lines. See [`Response::lines`].
pub struct Lines {
    inner: io::Lines<BufReader<Response>>,
}

impl Iterator for Lines {
    type Item = Result<String, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.map_err(Error::from_io))
    }
}
