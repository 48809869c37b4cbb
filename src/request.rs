//! Request preparation.
//!
//! A [`RequestSpec`] is what the caller hands the manager: method, URL,
//! headers and body. Each attempt prepares it into a [`PreparedRequest`]:
//! the final header set (Host, User-Agent, Accept-Encoding, auth, body
//! framing headers) plus the incremental prelude writer the connection
//! drains into its transport.

use std::fmt;
use std::io::{self, Read, Write};

use http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::body::{calculate_max_input, BodyWriter};
use crate::decode;
use crate::ext::{MethodExt, UrlExt};
use crate::util::Writer;
use crate::Error;

// //////////////////////////////////////////////////////////////////////////////////////////// BODY

/// A request body.
pub struct Body {
    inner: BodyInner,
    consumed: bool,
}

enum BodyInner {
    /// No body was passed at all.
    Empty,
    /// In-memory bytes. Known length, replayable on retry and redirect.
    Bytes { data: Vec<u8>, pos: usize },
    /// Streaming reader. `length` selects content-length framing,
    /// otherwise the body is sent chunked.
    Reader {
        reader: Box<dyn Read + Send>,
        length: Option<u64>,
    },
}

impl Body {
    pub fn empty() -> Body {
        Body {
            inner: BodyInner::Empty,
            consumed: false,
        }
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Body {
        Body {
            inner: BodyInner::Bytes {
                data: data.into(),
                pos: 0,
            },
            consumed: false,
        }
    }

    /// A streaming body sent with `Transfer-Encoding: chunked`.
    pub fn reader(reader: impl Read + Send + 'static) -> Body {
        Body {
            inner: BodyInner::Reader {
                reader: Box::new(reader),
                length: None,
            },
            consumed: false,
        }
    }

    /// A streaming body with a known length, sent with `Content-Length`.
    pub fn sized(reader: impl Read + Send + 'static, length: u64) -> Body {
        Body {
            inner: BodyInner::Reader {
                reader: Box::new(reader),
                length: Some(length),
            },
            consumed: false,
        }
    }

    /// Rewind for another attempt. Returns `false` when the body is a
    /// partly consumed stream that cannot be replayed.
    pub(crate) fn reset(&mut self) -> bool {
        match &mut self.inner {
            BodyInner::Empty => true,
            BodyInner::Bytes { pos, .. } => {
                *pos = 0;
                self.consumed = false;
                true
            }
            BodyInner::Reader { .. } => !self.consumed,
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match &mut self.inner {
            BodyInner::Empty => 0,
            BodyInner::Bytes { data, pos } => {
                let n = (data.len() - *pos).min(buf.len());
                buf[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                n
            }
            BodyInner::Reader { reader, .. } => reader.read(buf)?,
        };
        if n > 0 {
            self.consumed = true;
        }
        Ok(n)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            BodyInner::Empty => write!(f, "Body::Empty"),
            BodyInner::Bytes { data, .. } => write!(f, "Body::Bytes({})", data.len()),
            BodyInner::Reader { length, .. } => write!(f, "Body::Reader({:?})", length),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Body {
        Body::bytes(v)
    }
}

impl From<&[u8]> for Body {
    fn from(v: &[u8]) -> Body {
        Body::bytes(v.to_vec())
    }
}

impl From<&str> for Body {
    fn from(v: &str) -> Body {
        Body::bytes(v.as_bytes().to_vec())
    }
}

impl From<String> for Body {
    fn from(v: String) -> Body {
        Body::bytes(v.into_bytes())
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////// SPEC

/// Per-request defaults handed down from the manager.
#[derive(Debug, Clone)]
pub(crate) struct RequestDefaults {
    pub user_agent: String,
    pub headers: HeaderMap,
    pub decode_content: bool,
}

/// The caller's request, kept across attempts and redirects.
#[derive(Debug)]
pub(crate) struct RequestSpec {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Body,
}

impl RequestSpec {
    pub fn new(method: Method, url: Url, headers: HeaderMap, body: Body) -> RequestSpec {
        RequestSpec {
            method,
            url,
            headers,
            body,
        }
    }

    /// Carry the request over to a redirect target.
    ///
    /// `strip` headers are removed (sensitive headers on host change,
    /// plus body-describing headers when the body is dropped).
    pub fn redirect_to(
        &mut self,
        url: Url,
        method: Method,
        drop_body: bool,
        strip: &[HeaderName],
    ) {
        self.url = url;
        self.method = method;
        for name in strip {
            self.headers.remove(name);
        }
        if drop_body {
            self.headers.remove(header::CONTENT_LENGTH);
            self.headers.remove(header::TRANSFER_ENCODING);
            self.headers.remove(header::CONTENT_TYPE);
            self.body = Body::empty();
        }
    }

    /// Build the final header set and framing for one attempt.
    ///
    /// `extra` holds proxy headers for forward-proxied requests;
    /// `absolute_form` selects the forward-proxy request target.
    pub fn prepare(
        &mut self,
        defaults: &RequestDefaults,
        extra: Option<&HeaderMap>,
        absolute_form: bool,
    ) -> Result<PreparedRequest<'_>, Error> {
        let mut headers = self.headers.clone();

        if let Some(extra) = extra {
            for (name, value) in extra {
                if !headers.contains_key(name) {
                    headers.insert(name.clone(), value.clone());
                }
            }
        }

        // Default headers have the lowest precedence.
        for (name, value) in &defaults.headers {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }

        if !headers.contains_key(header::HOST) {
            let value = HeaderValue::from_str(&self.url.host_header())
                .map_err(|e| Error::BadHeader(e.to_string()))?;
            headers.insert(header::HOST, value);
        }

        if !headers.contains_key(header::USER_AGENT) {
            let value = HeaderValue::from_str(&defaults.user_agent)
                .map_err(|e| Error::BadHeader(e.to_string()))?;
            headers.insert(header::USER_AGENT, value);
        }

        if defaults.decode_content && !headers.contains_key(header::ACCEPT_ENCODING) {
            if let Some(v) = decode::accept_encoding() {
                headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static(v));
            }
        }

        if !headers.contains_key(header::AUTHORIZATION) {
            if let Some(value) = self.url.basic_auth() {
                headers.insert(header::AUTHORIZATION, value);
            }
        }

        let writer = self.select_framing(&headers)?;

        // The framing headers are derived, never inherited.
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
        if let Some((name, value)) = writer.body_header() {
            headers.insert(name, value);
        }

        let target = if absolute_form {
            self.url.absolute_form()
        } else {
            self.url.origin_form()
        };

        let rows: Vec<(HeaderName, HeaderValue)> = headers
            .iter()
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();

        Ok(PreparedRequest {
            method: self.method.clone(),
            target,
            rows,
            writer,
            phase: RequestPhase::SendLine,
            body: &mut self.body,
        })
    }

    fn select_framing(&self, headers: &HeaderMap) -> Result<BodyWriter, Error> {
        match &self.body.inner {
            BodyInner::Empty => {
                if self.method.omits_empty_content_length() {
                    Ok(BodyWriter::new_none())
                } else {
                    Ok(BodyWriter::new_sized(0))
                }
            }
            BodyInner::Bytes { data, .. } => Ok(BodyWriter::new_sized(data.len() as u64)),
            BodyInner::Reader { length, .. } => {
                let explicit = length.or_else(|| {
                    headers
                        .get(header::CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.trim().parse().ok())
                });
                match explicit {
                    Some(n) => Ok(BodyWriter::new_sized(n)),
                    // A streaming body on a bodyless method is allowed, but
                    // only with an explicit length: no automatic chunking.
                    None if !self.method.need_request_body() => Err(Error::BodyLengthRequired),
                    None => Ok(BodyWriter::new_chunked()),
                }
            }
        }
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////// PREPARED

#[derive(Clone, Copy, PartialEq, Eq)]
enum RequestPhase {
    SendLine,
    SendHeaders(usize),
    SendBody,
}

impl RequestPhase {
    fn is_prelude(&self) -> bool {
        matches!(self, RequestPhase::SendLine | RequestPhase::SendHeaders(_))
    }
}

/// One attempt's worth of serializable request.
pub(crate) struct PreparedRequest<'a> {
    method: Method,
    target: String,
    rows: Vec<(HeaderName, HeaderValue)>,
    writer: BodyWriter,
    phase: RequestPhase,
    body: &'a mut Body,
}

impl PreparedRequest<'_> {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Serialize as much of the request line and headers as fits.
    ///
    /// Incremental: call until it reports the prelude done. Errors with
    /// [`Error::OutputOverflow`] when a single row cannot fit the buffer.
    pub fn write_prelude(&mut self, w: &mut Writer) -> Result<bool, Error> {
        let at_start = w.len();

        loop {
            match self.phase {
                RequestPhase::SendLine => {
                    let method = &self.method;
                    let target = &self.target;
                    let ok = w.try_write(|w| write!(w, "{} {} HTTP/1.1\r\n", method, target));
                    if !ok {
                        break;
                    }
                    self.phase = RequestPhase::SendHeaders(0);
                }

                RequestPhase::SendHeaders(index) => {
                    if index == self.rows.len() {
                        // Terminating empty line.
                        if !w.try_write(|w| w.write_all(b"\r\n")) {
                            break;
                        }
                        self.phase = RequestPhase::SendBody;
                        return Ok(true);
                    }
                    let (name, value) = &self.rows[index];
                    let ok = w.try_write(|w| {
                        write!(w, "{}: ", name)?;
                        w.write_all(value.as_bytes())?;
                        w.write_all(b"\r\n")
                    });
                    if !ok {
                        break;
                    }
                    self.phase = RequestPhase::SendHeaders(index + 1);
                }

                RequestPhase::SendBody => return Ok(true),
            }
        }

        if w.len() == at_start {
            // No progress at all: the row is bigger than the whole buffer.
            return Err(Error::OutputOverflow);
        }
        Ok(false)
    }

    /// Frame the next slice of body into `out`.
    ///
    /// `Ok(0)` means the body is fully framed, terminator included.
    pub fn next_body_chunk(&mut self, out: &mut [u8]) -> Result<usize, Error> {
        debug_assert!(!self.phase.is_prelude());

        if self.writer.is_ended() {
            return Ok(0);
        }

        let mut w = Writer::new(out);

        let max_input = if self.writer.is_chunked() {
            let n = calculate_max_input(w.available());
            if n == 0 {
                return Err(Error::OutputOverflow);
            }
            n
        } else {
            (w.available() as u64)
                .min(self.writer.left_to_send().unwrap_or(0)) as usize
        };

        let mut staging = vec![0u8; max_input];
        let n = self.body.read_some(&mut staging).map_err(Error::Io)?;

        if n == 0 {
            if let Some(left) = self.writer.left_to_send() {
                if left > 0 {
                    return Err(Error::BodyShorterThanContentLength);
                }
            }
            // Chunked terminator.
            self.writer.write(&[], &mut w);
            return Ok(w.len());
        }

        let consumed = self.writer.write(&staging[..n], &mut w);
        debug_assert_eq!(consumed, n);

        Ok(w.len())
    }

    pub fn body_fully_sent(&self) -> bool {
        self.writer.is_ended()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn defaults() -> RequestDefaults {
        RequestDefaults {
            user_agent: "poolreq/test".into(),
            headers: HeaderMap::new(),
            decode_content: false,
        }
    }

    fn serialize(prepared: &mut PreparedRequest) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let mut w = Writer::new(&mut buf);
            let done = prepared.write_prelude(&mut w).unwrap();
            let n = w.len();
            out.extend_from_slice(&buf[..n]);
            if done {
                break;
            }
        }
        loop {
            let n = prepared.next_body_chunk(&mut buf).unwrap();
            if n == 0 && prepared.body_fully_sent() {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    fn spec(method: Method, url: &str, body: Body) -> RequestSpec {
        RequestSpec::new(
            method,
            crate::url::parse_url(url).unwrap(),
            HeaderMap::new(),
            body,
        )
    }

    #[test]
    fn get_without_body_omits_length_headers() {
        let mut spec = spec(Method::GET, "http://h.test/a?x=1#frag", Body::empty());
        let mut p = spec.prepare(&defaults(), None, false).unwrap();
        let wire = serialize(&mut p);
        let text = String::from_utf8(wire).unwrap();

        assert!(text.starts_with("GET /a?x=1 HTTP/1.1\r\n"));
        // Fragment never appears on the wire.
        assert!(!text.contains("frag"));
        assert!(!text.to_lowercase().contains("content-length"));
        assert!(!text.to_lowercase().contains("transfer-encoding"));
        assert!(text.contains("host: h.test\r\n"));
        assert!(text.contains("user-agent: poolreq/test\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn post_empty_body_sends_zero_length() {
        let mut spec = spec(Method::POST, "http://h.test/", Body::empty());
        let mut p = spec.prepare(&defaults(), None, false).unwrap();
        let wire = serialize(&mut p);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.contains("content-length: 0\r\n"));
    }

    #[test]
    fn bytes_body_uses_content_length() {
        let mut spec = spec(Method::POST, "http://h.test/login", Body::bytes("u=x"));
        let mut p = spec.prepare(&defaults(), None, false).unwrap();
        let wire = serialize(&mut p);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.contains("content-length: 3\r\n"));
        assert!(text.ends_with("\r\n\r\nu=x"));
    }

    #[test]
    fn reader_body_is_chunked() {
        let mut spec = spec(
            Method::POST,
            "http://h.test/up",
            Body::reader(io::Cursor::new(b"hello".to_vec())),
        );
        let mut p = spec.prepare(&defaults(), None, false).unwrap();
        let wire = serialize(&mut p);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(text.ends_with("5\r\nhello\r\n0\r\n\r\n"));
    }

    #[test]
    fn sized_reader_uses_content_length() {
        let mut spec = spec(
            Method::POST,
            "http://h.test/up",
            Body::sized(io::Cursor::new(b"hello".to_vec()), 5),
        );
        let mut p = spec.prepare(&defaults(), None, false).unwrap();
        let wire = serialize(&mut p);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn get_with_reader_body_requires_length() {
        let mut spec = spec(
            Method::GET,
            "http://h.test/",
            Body::reader(io::Cursor::new(b"x".to_vec())),
        );
        let err = spec.prepare(&defaults(), None, false).err().unwrap();
        assert!(matches!(err, Error::BodyLengthRequired));
    }

    #[test]
    fn absolute_form_for_forward_proxy() {
        let mut spec = spec(Method::GET, "http://h.test:8080/a", Body::empty());
        let mut p = spec.prepare(&defaults(), None, true).unwrap();
        let wire = serialize(&mut p);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("GET http://h.test:8080/a HTTP/1.1\r\n"));
        assert!(text.contains("host: h.test:8080\r\n"));
    }

    #[test]
    fn userinfo_becomes_authorization() {
        let mut spec = spec(Method::GET, "http://user:pw@h.test/", Body::empty());
        let mut p = spec.prepare(&defaults(), None, false).unwrap();
        let wire = serialize(&mut p);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.contains("authorization: Basic "));
    }

    #[test]
    fn caller_headers_win_over_defaults() {
        let mut d = defaults();
        d.headers
            .insert(header::ACCEPT, HeaderValue::from_static("default/accept"));

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("caller/accept"));
        let mut spec = RequestSpec::new(
            Method::GET,
            crate::url::parse_url("http://h.test/").unwrap(),
            headers,
            Body::empty(),
        );
        let mut p = spec.prepare(&d, None, false).unwrap();
        let wire = serialize(&mut p);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.contains("accept: caller/accept\r\n"));
        assert!(!text.contains("default/accept"));
    }

    #[test]
    fn small_output_buffer_still_serializes() {
        let mut spec = spec(Method::GET, "http://h.test/long/path/is/long", Body::empty());
        let mut p = spec.prepare(&defaults(), None, false).unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 40];
        loop {
            let mut w = Writer::new(&mut buf);
            let done = p.write_prelude(&mut w).unwrap();
            let n = w.len();
            out.extend_from_slice(&buf[..n]);
            if done {
                break;
            }
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET /long/path/is/long HTTP/1.1\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn tiny_output_buffer_overflows() {
        let mut spec = spec(Method::GET, "http://h.test/quite/a/long/path", Body::empty());
        let mut p = spec.prepare(&defaults(), None, false).unwrap();
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        assert!(matches!(
            p.write_prelude(&mut w),
            Err(Error::OutputOverflow)
        ));
    }

    #[test]
    fn redirect_strips_and_drops() {
        let mut spec = RequestSpec::new(
            Method::POST,
            crate::url::parse_url("https://a.test/login").unwrap(),
            {
                let mut h = HeaderMap::new();
                h.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xx"));
                h.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                h
            },
            Body::bytes("u=x"),
        );

        spec.redirect_to(
            crate::url::parse_url("http://b.test/home").unwrap(),
            Method::GET,
            true,
            &[header::AUTHORIZATION],
        );

        assert_eq!(spec.method, Method::GET);
        assert!(matches!(spec.body.inner, BodyInner::Empty));
        assert!(!spec.headers.contains_key(header::AUTHORIZATION));
        assert!(!spec.headers.contains_key(header::CONTENT_TYPE));

        let mut p = spec.prepare(&defaults(), None, false).unwrap();
        let wire = serialize(&mut p);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("GET /home HTTP/1.1\r\n"));
        assert!(!text.to_lowercase().contains("content-length"));
    }

    #[test]
    fn body_reset_semantics() {
        let mut b = Body::bytes("abc");
        let mut buf = [0u8; 8];
        assert_eq!(b.read_some(&mut buf).unwrap(), 3);
        assert!(b.reset());
        assert_eq!(b.read_some(&mut buf).unwrap(), 3);

        let mut b = Body::reader(io::Cursor::new(b"abc".to_vec()));
        assert!(b.reset());
        assert_eq!(b.read_some(&mut buf).unwrap(), 3);
        assert!(!b.reset());
    }
}
