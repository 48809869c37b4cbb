//! Sans-IO request/response body framing.
//!
//! [`BodyWriter`] and [`BodyReader`] transform between buffers: the caller
//! moves bytes between them and the transport. Neither touches a socket,
//! which keeps the framing state machines independently testable and lets
//! the connection drive them under whatever timeout regime applies.

use std::io::Write;

use http::{header, HeaderMap, HeaderName, HeaderValue, Method};

use crate::ext::HeaderMapExt;
use crate::util::Writer;
use crate::Error;

/// Body framing of a message as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// No body. HEAD responses, 1xx/204/304, or bodyless requests.
    NoBody,
    /// `Content-Length` delimited.
    LengthDelimited(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Delimited by connection close. HTTP/1.0 semantics.
    CloseDelimited,
}

/// Largest per-chunk overhead the chunked writer can produce:
/// 16 hex digits + `\r\n` + data + `\r\n`.
const MAX_CHUNK_OVERHEAD: usize = 16 + 2 + 2;

/// How much input fits in `output_len` bytes of chunked output.
pub(crate) fn calculate_max_input(output_len: usize) -> usize {
    output_len.saturating_sub(MAX_CHUNK_OVERHEAD)
}

// //////////////////////////////////////////////////////////////////////////////////////////// WRITER

/// Request body serializer.
#[derive(Debug, Clone, Copy)]
pub(crate) enum BodyWriter {
    /// No body to send.
    None,
    /// `Content-Length` framing: raw copy, counted down.
    Sized { total: u64, left: u64 },
    /// `Transfer-Encoding: chunked` framing.
    Chunked { ended: bool },
}

impl BodyWriter {
    pub fn new_none() -> BodyWriter {
        BodyWriter::None
    }

    pub fn new_sized(total: u64) -> BodyWriter {
        BodyWriter::Sized { total, left: total }
    }

    pub fn new_chunked() -> BodyWriter {
        BodyWriter::Chunked { ended: false }
    }

    /// Frame `input` into `w`. Returns the amount of input consumed.
    ///
    /// For chunked framing, an empty `input` signals end-of-body and
    /// writes the terminating `0\r\n\r\n`.
    pub fn write(&mut self, input: &[u8], w: &mut Writer) -> usize {
        match self {
            BodyWriter::None => 0,
            BodyWriter::Sized { left, .. } => {
                let n = (input.len() as u64).min(*left).min(w.available() as u64) as usize;
                w.try_write(|w| w.write_all(&input[..n]));
                *left -= n as u64;
                n
            }
            BodyWriter::Chunked { ended } => {
                if *ended {
                    return 0;
                }
                if input.is_empty() {
                    // 0\r\n\r\n
                    let done = w.try_write(|w| w.write_all(b"0\r\n\r\n"));
                    if done {
                        *ended = true;
                    }
                    return 0;
                }
                let n = input.len().min(calculate_max_input(w.available()));
                if n == 0 {
                    return 0;
                }
                w.try_write(|w| {
                    write!(w, "{:x}\r\n", n)?;
                    w.write_all(&input[..n])?;
                    w.write_all(b"\r\n")
                });
                n
            }
        }
    }

    /// Bytes left before the declared `Content-Length` is fulfilled.
    /// `None` for chunked and bodyless writers.
    pub fn left_to_send(&self) -> Option<u64> {
        match self {
            BodyWriter::Sized { left, .. } => Some(*left),
            _ => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        match self {
            BodyWriter::None => true,
            BodyWriter::Sized { left, .. } => *left == 0,
            BodyWriter::Chunked { ended } => *ended,
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, BodyWriter::Chunked { .. })
    }

    /// The header announcing this framing.
    pub fn body_header(&self) -> Option<(HeaderName, HeaderValue)> {
        match self {
            BodyWriter::None => None,
            BodyWriter::Sized { total, .. } => Some((
                header::CONTENT_LENGTH,
                HeaderValue::from_str(&total.to_string()).unwrap(),
            )),
            BodyWriter::Chunked { .. } => Some((
                header::TRANSFER_ENCODING,
                HeaderValue::from_static("chunked"),
            )),
        }
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////// READER

/// Response body deserializer.
#[derive(Debug)]
pub(crate) enum BodyReader {
    NoBody,
    LengthDelimited { total: u64, left: u64 },
    Chunked(ChunkedDecoder),
    CloseDelimited { ended: bool },
}

impl BodyReader {
    /// Select the body mode for a response.
    ///
    /// Order mandated by RFC 7230: no body for HEAD and 1xx/204/304, then
    /// chunked transfer-encoding (any hop that declares it), then
    /// content-length, finally close-delimited.
    pub fn for_response(
        http10: bool,
        method: &Method,
        status: u16,
        headers: &HeaderMap,
        max_chunk: u64,
    ) -> Result<BodyReader, Error> {
        if *method == Method::HEAD || (100..200).contains(&status) || status == 204 || status == 304
        {
            return Ok(BodyReader::NoBody);
        }

        if !http10 && headers.has_token(header::TRANSFER_ENCODING, "chunked") {
            return Ok(BodyReader::Chunked(ChunkedDecoder::new(max_chunk)));
        }

        if let Some(v) = headers.get(header::CONTENT_LENGTH) {
            let total: u64 = v
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| Error::BadHeader("content-length is not a number".into()))?;
            return Ok(BodyReader::LengthDelimited { total, left: total });
        }

        Ok(BodyReader::CloseDelimited { ended: false })
    }

    /// Deframe from `input` into `output`.
    ///
    /// The result is `(input consumed, output used)`.
    pub fn read(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize), Error> {
        match self {
            BodyReader::NoBody => Ok((0, 0)),
            BodyReader::LengthDelimited { left, .. } => {
                let n = (input.len() as u64)
                    .min(*left)
                    .min(output.len() as u64) as usize;
                output[..n].copy_from_slice(&input[..n]);
                *left -= n as u64;
                Ok((n, n))
            }
            BodyReader::Chunked(dec) => dec.read(input, output),
            BodyReader::CloseDelimited { .. } => {
                let n = input.len().min(output.len());
                output[..n].copy_from_slice(&input[..n]);
                Ok((n, n))
            }
        }
    }

    /// Notify the reader the transport reached EOF.
    ///
    /// Regular end for close-delimited bodies, protocol error otherwise.
    pub fn input_ended(&mut self) -> Result<(), Error> {
        match self {
            BodyReader::CloseDelimited { ended } => {
                *ended = true;
                Ok(())
            }
            _ if self.is_ended() => Ok(()),
            _ => Err(Error::UnexpectedEof),
        }
    }

    pub fn is_ended(&self) -> bool {
        match self {
            BodyReader::NoBody => true,
            BodyReader::LengthDelimited { left, .. } => *left == 0,
            BodyReader::Chunked(dec) => dec.is_done(),
            BodyReader::CloseDelimited { ended } => *ended,
        }
    }

    pub fn body_mode(&self) -> BodyMode {
        match self {
            BodyReader::NoBody => BodyMode::NoBody,
            BodyReader::LengthDelimited { total, .. } => BodyMode::LengthDelimited(*total),
            BodyReader::Chunked(_) => BodyMode::Chunked,
            BodyReader::CloseDelimited { .. } => BodyMode::CloseDelimited,
        }
    }

    /// Trailer headers, available after a chunked body completed.
    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        match self {
            BodyReader::Chunked(dec) => dec.trailers.take(),
            _ => None,
        }
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////// CHUNKED

/// Longest accepted chunk-size line, including extensions.
const MAX_SIZE_LINE: usize = 256;

/// Cap on accumulated trailer bytes.
const MAX_TRAILER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    SizeLine,
    Data,
    DataCr,
    DataLf,
    Trailers,
    Done,
}

/// Incremental `Transfer-Encoding: chunked` decoder.
///
/// `SIZE_LINE → DATA(n) → CRLF → (SIZE_LINE | TRAILERS → DONE)`
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: ChunkState,
    chunk_left: u64,
    size_line: Vec<u8>,
    trailer_buf: Vec<u8>,
    trailers: Option<HeaderMap>,
    max_chunk: u64,
}

impl ChunkedDecoder {
    pub fn new(max_chunk: u64) -> ChunkedDecoder {
        ChunkedDecoder {
            state: ChunkState::SizeLine,
            chunk_left: 0,
            size_line: Vec::new(),
            trailer_buf: Vec::new(),
            trailers: None,
            max_chunk,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    fn read(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize), Error> {
        let mut iu = 0;
        let mut ou = 0;

        while iu < input.len() {
            match self.state {
                ChunkState::SizeLine => {
                    let b = input[iu];
                    iu += 1;
                    if b == b'\n' {
                        self.parse_size_line()?;
                    } else {
                        if self.size_line.len() >= MAX_SIZE_LINE {
                            return Err(Error::ChunkLenNotANumber);
                        }
                        self.size_line.push(b);
                    }
                }

                ChunkState::Data => {
                    if ou == output.len() {
                        break;
                    }
                    let n = (self.chunk_left)
                        .min((input.len() - iu) as u64)
                        .min((output.len() - ou) as u64) as usize;
                    output[ou..ou + n].copy_from_slice(&input[iu..iu + n]);
                    iu += n;
                    ou += n;
                    self.chunk_left -= n as u64;
                    if self.chunk_left == 0 {
                        self.state = ChunkState::DataCr;
                    }
                }

                ChunkState::DataCr => {
                    if input[iu] != b'\r' {
                        return Err(Error::ChunkExpectedCrLf);
                    }
                    iu += 1;
                    self.state = ChunkState::DataLf;
                }

                ChunkState::DataLf => {
                    if input[iu] != b'\n' {
                        return Err(Error::ChunkExpectedCrLf);
                    }
                    iu += 1;
                    self.state = ChunkState::SizeLine;
                }

                ChunkState::Trailers => {
                    let b = input[iu];
                    iu += 1;
                    if self.trailer_buf.len() >= MAX_TRAILER_BYTES {
                        return Err(Error::HeaderOverflow);
                    }
                    self.trailer_buf.push(b);
                    if self.trailer_block_complete() {
                        self.parse_trailers()?;
                        self.state = ChunkState::Done;
                    }
                }

                ChunkState::Done => break,
            }
        }

        Ok((iu, ou))
    }

    fn parse_size_line(&mut self) -> Result<(), Error> {
        let line = std::mem::take(&mut self.size_line);
        if !line.is_ascii() {
            return Err(Error::ChunkLenNotAscii);
        }
        let line = std::str::from_utf8(&line).expect("ascii checked above");
        // Strip trailing \r and any chunk extension.
        let line = line.strip_suffix('\r').unwrap_or(line);
        let size_part = line.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_part, 16).map_err(|_| Error::ChunkLenNotANumber)?;

        if size > self.max_chunk {
            return Err(Error::ChunkTooLarge);
        }

        if size == 0 {
            self.state = ChunkState::Trailers;
        } else {
            self.chunk_left = size;
            self.state = ChunkState::Data;
        }
        Ok(())
    }

    /// The trailer block ends at the first empty line: either immediately
    /// (`\r\n`) or after header rows (`...\r\n\r\n`).
    fn trailer_block_complete(&self) -> bool {
        let b = &self.trailer_buf;
        b.ends_with(b"\r\n") && (b.len() == 2 || b.ends_with(b"\r\n\r\n"))
    }

    fn parse_trailers(&mut self) -> Result<(), Error> {
        let mut map = HeaderMap::new();
        if self.trailer_buf.len() > 2 {
            let mut headers = [httparse::EMPTY_HEADER; 32];
            match httparse::parse_headers(&self.trailer_buf, &mut headers) {
                Ok(httparse::Status::Complete((_, parsed))) => {
                    for h in parsed {
                        let name = HeaderName::from_bytes(h.name.as_bytes())
                            .map_err(|e| Error::BadHeader(e.to_string()))?;
                        let value = HeaderValue::from_bytes(h.value)
                            .map_err(|e| Error::BadHeader(e.to_string()))?;
                        map.append(name, value);
                    }
                }
                Ok(httparse::Status::Partial) => {
                    return Err(Error::HttpParseFail("incomplete trailers".into()))
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.trailers = Some(map);
        Ok(())
    }
}
