//! Layered response content decoding.
//!
//! Decoders are pull readers stacked over the raw (already deframed) body
//! in reverse order of the `Content-Encoding` tokens. The stack is bounded
//! both in depth and, optionally, in total decoded bytes so a hostile
//! server cannot amplify a small response into unbounded CPU or memory.

use std::io::{self, Read};

use http::{header, HeaderMap};

use crate::Error;

/// Default cap on the number of chained (non-identity) encodings.
pub(crate) const DEFAULT_MAX_ENCODINGS: usize = 5;

pub(crate) type BoxedReader = Box<dyn Read + Send + 'static>;

/// One `Content-Encoding` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Coding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
    Zstd,
    Unknown(String),
}

/// All `Content-Encoding` tokens in application order.
pub(crate) fn parse_content_encoding(headers: &HeaderMap) -> Vec<Coding> {
    headers
        .get_all(header::CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|s| s.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .map(|t| match t.as_str() {
            "identity" => Coding::Identity,
            "gzip" | "x-gzip" => Coding::Gzip,
            "deflate" => Coding::Deflate,
            "br" => Coding::Brotli,
            "zstd" => Coding::Zstd,
            _ => Coding::Unknown(t),
        })
        .collect()
}

/// The encodings this build can decode, for `Accept-Encoding`.
pub(crate) fn accept_encoding() -> Option<&'static str> {
    let all: &[(&str, bool)] = &[
        ("gzip", cfg!(feature = "gzip")),
        ("deflate", cfg!(feature = "deflate")),
        ("br", cfg!(feature = "brotli")),
        ("zstd", cfg!(feature = "zstd")),
    ];
    // The set is fixed at compile time, so build the value once.
    static VALUE: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    let v = VALUE.get_or_init(|| {
        all.iter()
            .filter(|(_, on)| *on)
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    });
    (!v.is_empty()).then_some(v.as_str())
}

/// Stack decoders over `raw` for the given codings.
///
/// `codings` are in the order the server applied them; decoders unwind
/// them back to front. `max_bytes` bounds the cumulative decoded output.
pub(crate) fn wrap_decoders(
    raw: BoxedReader,
    codings: &[Coding],
    max_encodings: usize,
    max_bytes: Option<u64>,
) -> Result<BoxedReader, Error> {
    let active = codings.iter().filter(|c| **c != Coding::Identity).count();
    if active > max_encodings {
        return Err(Error::TooManyEncodings);
    }
    if active == 0 {
        return Ok(raw);
    }

    let mut reader = raw;
    for c in codings.iter().rev() {
        reader = match c {
            Coding::Identity => reader,
            Coding::Gzip => gzip_decoder(reader)?,
            Coding::Deflate => deflate_decoder(reader)?,
            Coding::Brotli => brotli_decoder(reader)?,
            Coding::Zstd => zstd_decoder(reader)?,
            Coding::Unknown(t) => {
                return Err(Error::ContentDecoding(format!(
                    "unsupported content-encoding: {}",
                    t
                )));
            }
        };
    }

    // Decoder failures surface as ContentDecoding; transport errors pass
    // through untouched. Applied outermost so it sees every layer.
    let mapped = ErrorMapReader { inner: reader };

    Ok(match max_bytes {
        Some(max) => Box::new(LimitedDecode {
            inner: mapped,
            left: max,
        }),
        None => Box::new(mapped),
    })
}

#[cfg(feature = "gzip")]
fn gzip_decoder(r: BoxedReader) -> Result<BoxedReader, Error> {
    // Multi-member: servers occasionally concatenate gzip streams.
    Ok(Box::new(flate2::read::MultiGzDecoder::new(r)))
}

#[cfg(not(feature = "gzip"))]
fn gzip_decoder(_r: BoxedReader) -> Result<BoxedReader, Error> {
    Err(Error::ContentDecoding(
        "gzip support not compiled in".into(),
    ))
}

#[cfg(feature = "deflate")]
fn deflate_decoder(r: BoxedReader) -> Result<BoxedReader, Error> {
    Ok(Box::new(DeflateReader {
        state: DeflateState::Pending(Some(r)),
    }))
}

#[cfg(not(feature = "deflate"))]
fn deflate_decoder(_r: BoxedReader) -> Result<BoxedReader, Error> {
    Err(Error::ContentDecoding(
        "deflate support not compiled in".into(),
    ))
}

#[cfg(feature = "brotli")]
fn brotli_decoder(r: BoxedReader) -> Result<BoxedReader, Error> {
    Ok(Box::new(brotli::Decompressor::new(r, 8 * 1024)))
}

#[cfg(not(feature = "brotli"))]
fn brotli_decoder(_r: BoxedReader) -> Result<BoxedReader, Error> {
    Err(Error::ContentDecoding("br support not compiled in".into()))
}

#[cfg(feature = "zstd")]
fn zstd_decoder(r: BoxedReader) -> Result<BoxedReader, Error> {
    let dec = zstd::stream::read::Decoder::new(r)
        .map_err(|e| Error::ContentDecoding(format!("zstd: {}", e)))?;
    Ok(Box::new(dec))
}

#[cfg(not(feature = "zstd"))]
fn zstd_decoder(_r: BoxedReader) -> Result<BoxedReader, Error> {
    Err(Error::ContentDecoding("zstd support not compiled in".into()))
}

// //////////////////////////////////////////////////////////////////////////////////////////// DEFLATE SNIFF

/// RFC 9110 `deflate` means zlib-wrapped, but plenty of servers send raw
/// deflate. Sniff the two-byte zlib header and fall back on raw.
#[cfg(feature = "deflate")]
struct DeflateReader {
    state: DeflateState,
}

#[cfg(feature = "deflate")]
enum DeflateState {
    Pending(Option<BoxedReader>),
    Zlib(flate2::read::ZlibDecoder<PrefixReader>),
    Raw(flate2::read::DeflateDecoder<PrefixReader>),
    Empty,
}

#[cfg(feature = "deflate")]
impl Read for DeflateReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let DeflateState::Pending(inner) = &mut self.state {
            let mut inner = inner.take().expect("pending reader present");
            let mut header = [0u8; 2];
            let mut got = 0;
            while got < 2 {
                let n = inner.read(&mut header[got..])?;
                if n == 0 {
                    break;
                }
                got += n;
            }
            if got == 0 {
                self.state = DeflateState::Empty;
                return Ok(0);
            }
            let prefixed = PrefixReader {
                prefix: header[..got].to_vec(),
                pos: 0,
                inner,
            };
            let is_zlib = got == 2
                && (header[0] & 0x0f) == 8
                && (u16::from(header[0]) << 8 | u16::from(header[1])) % 31 == 0;
            self.state = if is_zlib {
                DeflateState::Zlib(flate2::read::ZlibDecoder::new(prefixed))
            } else {
                DeflateState::Raw(flate2::read::DeflateDecoder::new(prefixed))
            };
        }

        match &mut self.state {
            DeflateState::Zlib(r) => r.read(buf),
            DeflateState::Raw(r) => r.read(buf),
            DeflateState::Empty => Ok(0),
            DeflateState::Pending(_) => unreachable!("resolved above"),
        }
    }
}

/// Replays sniffed bytes before the remaining stream.
#[cfg(feature = "deflate")]
struct PrefixReader {
    prefix: Vec<u8>,
    pos: usize,
    inner: BoxedReader,
}

#[cfg(feature = "deflate")]
impl Read for PrefixReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.prefix.len() {
            let n = (self.prefix.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.prefix[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        self.inner.read(buf)
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////// GUARDS

/// Converts decoder io errors into [`Error::ContentDecoding`], leaving
/// wrapped transport errors intact.
struct ErrorMapReader {
    inner: BoxedReader,
}

impl Read for ErrorMapReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|e| {
            let carries_ours = e
                .get_ref()
                .map(|inner| inner.is::<Error>())
                .unwrap_or(false);
            if carries_ours {
                e
            } else {
                Error::ContentDecoding(e.to_string()).into_io()
            }
        })
    }
}

/// Errors once more than `left` decoded bytes have been produced.
struct LimitedDecode {
    inner: ErrorMapReader,
    left: u64,
}

impl Read for LimitedDecode {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n as u64 > self.left {
            return Err(Error::DecodeOverflow.into_io());
        }
        self.left -= n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_all(wire: &[u8], codings: &[Coding], max_bytes: Option<u64>) -> Result<Vec<u8>, Error> {
        let raw: BoxedReader = Box::new(io::Cursor::new(wire.to_vec()));
        let mut reader = wrap_decoders(raw, codings, DEFAULT_MAX_ENCODINGS, max_bytes)?;
        let mut out = Vec::new();
        reader
            .read_to_end(&mut out)
            .map_err(Error::from_io)?;
        Ok(out)
    }

    #[test]
    fn parses_comma_separated_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "GZip, br".parse().unwrap());
        let codings = parse_content_encoding(&headers);
        assert_eq!(codings, vec![Coding::Gzip, Coding::Brotli]);
    }

    #[test]
    fn identity_is_passthrough() {
        let out = decode_all(b"plain", &[Coding::Identity], None).unwrap();
        assert_eq!(out, b"plain");
    }

    #[test]
    fn unknown_token_rejected() {
        let err = decode_all(b"x", &[Coding::Unknown("snappy".into())], None).unwrap_err();
        assert!(matches!(err, Error::ContentDecoding(_)));
    }

    #[test]
    fn chain_depth_cap() {
        let codings = vec![Coding::Gzip; DEFAULT_MAX_ENCODINGS + 1];
        let raw: BoxedReader = Box::new(io::Cursor::new(Vec::new()));
        let err = wrap_decoders(raw, &codings, DEFAULT_MAX_ENCODINGS, None)
            .err()
            .unwrap();
        assert!(matches!(err, Error::TooManyEncodings));
    }

    #[cfg(feature = "gzip")]
    mod gzip {
        use super::*;
        use flate2::read::GzEncoder;
        use flate2::Compression;

        fn gzip(data: &[u8]) -> Vec<u8> {
            let mut enc = GzEncoder::new(data, Compression::default());
            let mut out = Vec::new();
            enc.read_to_end(&mut out).unwrap();
            out
        }

        #[test]
        fn round_trip() {
            let wire = gzip(b"Hello World");
            let out = decode_all(&wire, &[Coding::Gzip], None).unwrap();
            assert_eq!(out, b"Hello World");
        }

        #[test]
        fn garbage_is_decoding_error() {
            let err = decode_all(b"not gzip at all", &[Coding::Gzip], None).unwrap_err();
            assert!(matches!(err, Error::ContentDecoding(_)));
        }

        #[test]
        fn decode_overflow() {
            let wire = gzip(&vec![0u8; 4096]);
            let err = decode_all(&wire, &[Coding::Gzip], Some(100)).unwrap_err();
            assert!(matches!(err, Error::DecodeOverflow));
        }

        #[test]
        fn within_limit_ok() {
            let wire = gzip(b"small");
            let out = decode_all(&wire, &[Coding::Gzip], Some(1024)).unwrap();
            assert_eq!(out, b"small");
        }
    }

    #[cfg(feature = "deflate")]
    mod deflate {
        use super::*;
        use flate2::read::{DeflateEncoder, ZlibEncoder};
        use flate2::Compression;

        #[test]
        fn zlib_wrapped() {
            let mut enc = ZlibEncoder::new(&b"zlib payload"[..], Compression::default());
            let mut wire = Vec::new();
            enc.read_to_end(&mut wire).unwrap();

            let out = decode_all(&wire, &[Coding::Deflate], None).unwrap();
            assert_eq!(out, b"zlib payload");
        }

        #[test]
        fn raw_fallback() {
            let mut enc = DeflateEncoder::new(&b"raw payload"[..], Compression::default());
            let mut wire = Vec::new();
            enc.read_to_end(&mut wire).unwrap();

            let out = decode_all(&wire, &[Coding::Deflate], None).unwrap();
            assert_eq!(out, b"raw payload");
        }

        #[test]
        fn empty_body() {
            let out = decode_all(b"", &[Coding::Deflate], None).unwrap();
            assert!(out.is_empty());
        }
    }

    #[cfg(all(feature = "gzip", feature = "deflate"))]
    #[test]
    fn chained_encodings_unwound_in_reverse() {
        use flate2::read::{DeflateEncoder, GzEncoder};
        use flate2::Compression;

        // Server applied deflate first, then gzip.
        let mut deflated = Vec::new();
        DeflateEncoder::new(&b"chained"[..], Compression::default())
            .read_to_end(&mut deflated)
            .unwrap();
        let mut wire = Vec::new();
        GzEncoder::new(&deflated[..], Compression::default())
            .read_to_end(&mut wire)
            .unwrap();

        let out = decode_all(&wire, &[Coding::Deflate, Coding::Gzip], None).unwrap();
        assert_eq!(out, b"chained");
    }
}
