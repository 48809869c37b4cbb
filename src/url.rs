//! Url validation and canonicalization.
//!
//! The crate uses [`url::Url`] as its URL type. Parsing through the `url`
//! crate already lowercases the scheme, IDNA-normalizes and lowercases the
//! host, elides scheme-default ports and percent-encodes reserved
//! characters idempotently. This module layers the validation the request
//! engine needs on top: only `http`/`https`, a non-empty host, and
//! relative-reference resolution for redirects.

use url::Url;

use crate::Error;

/// Parse and validate a request URL.
pub(crate) fn parse_url(s: &str) -> Result<Url, Error> {
    let url = Url::parse(s).map_err(|e| Error::InvalidUrl(format!("{}: {}", s, e)))?;
    validate_url(&url)?;
    Ok(url)
}

/// Validate an already parsed URL for use as a request target.
pub(crate) fn validate_url(url: &Url) -> Result<(), Error> {
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::InvalidUrl(format!("unsupported scheme: {}", other)));
        }
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(Error::InvalidUrl(format!("no host in {}", url)));
    }
    Ok(())
}

/// Resolve a `Location` header against the URL of the redirecting response.
pub(crate) fn redirect_target(base: &Url, location: &str) -> Result<Url, Error> {
    let url = base
        .join(location)
        .map_err(|e| Error::BadLocationHeader(format!("{}: {}", location, e)))?;
    validate_url(&url)?;
    Ok(url)
}

/// True when two URLs point at the same host.
///
/// Used to decide whether sensitive headers survive a redirect.
pub(crate) fn same_host(a: &Url, b: &Url) -> bool {
    a.host_str() == b.host_str()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(
            parse_url("ftp://example.test/"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn rejects_missing_host() {
        assert!(matches!(parse_url("http:///path"), Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn rejects_out_of_range_port() {
        // The url crate rejects ports > 65535 at parse time.
        assert!(matches!(
            parse_url("http://example.test:99999/"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn canonicalizes_host_case_and_scheme() {
        let url = parse_url("HTTP://EXAMPLE.Test/Path").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host_str(), Some("example.test"));
        // Path case is preserved.
        assert_eq!(url.path(), "/Path");
    }

    #[test]
    fn percent_encoding_is_idempotent() {
        let once = parse_url("http://h.test/a b").unwrap();
        let twice = parse_url(once.as_str()).unwrap();
        assert_eq!(once.as_str(), twice.as_str());
        assert_eq!(once.path(), "/a%20b");
    }

    #[test]
    fn path_never_empty() {
        let url = parse_url("http://h.test").unwrap();
        assert_eq!(url.path(), "/");
    }

    #[test]
    fn relative_redirect_resolution() {
        let base = parse_url("http://h.test/a/b?q=1").unwrap();
        let next = redirect_target(&base, "/home").unwrap();
        assert_eq!(next.as_str(), "http://h.test/home");

        let next = redirect_target(&base, "c").unwrap();
        assert_eq!(next.as_str(), "http://h.test/a/c");

        let next = redirect_target(&base, "https://other.test/x").unwrap();
        assert_eq!(next.host_str(), Some("other.test"));
    }

    #[test]
    fn redirect_to_bad_scheme_rejected() {
        let base = parse_url("http://h.test/").unwrap();
        assert!(redirect_target(&base, "file:///etc/passwd").is_err());
    }
}
