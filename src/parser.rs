//! Response head parsing on top of httparse.

use http::{HeaderName, HeaderValue, Response, StatusCode, Version};

use crate::util::log_data;
use crate::Error;

/// Reason phrase of the status line.
///
/// `http::Response` has no slot for it, so it rides along as an extension.
#[derive(Debug, Clone)]
pub struct ReasonPhrase(pub(crate) Box<str>);

impl ReasonPhrase {
    /// The reason phrase as sent by the server.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Try to parse a complete response head from `input`.
///
/// Returns `None` when more input is needed. On success the returned
/// `usize` is the number of input bytes consumed by the head.
pub(crate) fn try_parse_response<const N: usize>(
    input: &[u8],
) -> Result<Option<(usize, Response<()>)>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; N];
    let mut res = httparse::Response::new(&mut headers);

    let mut config = httparse::ParserConfig::default();
    // Obsolete line folding is accepted and folded into the value with
    // whitespace, never rejected outright.
    config.allow_obsolete_multiline_headers_in_responses(true);

    let input_used = match config.parse_response(&mut res, input) {
        Ok(httparse::Status::Complete(v)) => v,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    log_data(&input[..input_used]);

    let version = match res.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(Error::MissingResponseVersion),
    };

    let status = res
        .code
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or(Error::ResponseInvalidStatus)?;

    let mut builder = Response::builder().version(version).status(status);

    if let Some(reason) = res.reason {
        if !reason.is_empty() {
            builder = builder.extension(ReasonPhrase(reason.into()));
        }
    }

    if let Some(map) = builder.headers_mut() {
        map.reserve(res.headers.len());
        for h in res.headers {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|e| Error::BadHeader(e.to_string()))?;
            let value =
                HeaderValue::from_bytes(h.value).map_err(|e| Error::BadHeader(e.to_string()))?;
            map.append(name, value);
        }
    }

    let response = builder
        .body(())
        .map_err(|e| Error::HttpParseFail(e.to_string()))?;

    Ok(Some((input_used, response)))
}
