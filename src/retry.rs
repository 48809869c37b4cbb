//! Retry and redirect policy.
//!
//! [`Retry`] is an immutable budget: every decision produces a successor
//! value via [`Retry::increment`], never an in-place mutation, so a single
//! policy value can be shared as a default across requests. Exhaustion
//! turns the accumulated history into [`Error::MaxRetries`].

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use http::{header, HeaderMap, HeaderName, Method, StatusCode};

use crate::ext::MethodExt;
use crate::Error;

/// Hard ceiling on exponential backoff.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(120);

/// Statuses where a `Retry-After` header alone makes the response
/// retryable.
pub const RETRY_AFTER_STATUS_CODES: [u16; 3] = [413, 429, 503];

/// One attempt in a request's life.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub method: Option<Method>,
    pub url: String,
    /// Error message when the attempt failed below HTTP.
    pub error: Option<String>,
    /// Status code when the attempt produced a retryable response.
    pub status: Option<u16>,
    /// Target of a followed redirect.
    pub redirect_location: Option<String>,
}

impl RetryEvent {
    fn is_redirect(&self) -> bool {
        self.redirect_location.is_some()
    }
}

/// Attempt history, oldest first.
pub type RetryHistory = Vec<RetryEvent>;

/// What an attempt came back with, as seen by the controller.
#[derive(Debug)]
pub(crate) enum AttemptOutcome<'a> {
    /// The attempt failed with an error.
    Failed(&'a Error),
    /// The attempt produced a response with a retryable status.
    Status(StatusCode),
    /// The attempt produced a redirect that will be followed.
    Redirect {
        status: StatusCode,
        location: &'a str,
    },
}

/// Retry budget and backoff policy.
///
/// Counters are per category. `None` means the category is only bounded
/// by `total`; `Some(0)` means the next failure of that category is
/// terminal.
#[derive(Debug, Clone)]
pub struct Retry {
    pub total: Option<u32>,
    pub connect: Option<u32>,
    pub read: Option<u32>,
    pub redirect: Option<u32>,
    pub status: Option<u32>,
    pub other: Option<u32>,

    /// Methods eligible for read/status retries. `None` allows all.
    pub allowed_methods: Option<HashSet<Method>>,
    /// Statuses that are always retryable (for eligible methods).
    pub status_forcelist: HashSet<u16>,

    /// Base factor of the exponential backoff, in seconds.
    pub backoff_factor: f64,
    pub backoff_max: Duration,
    /// Uniform random extra sleep in `[0, jitter)` seconds.
    pub backoff_jitter: f64,
    pub respect_retry_after_header: bool,
    /// Cap on a server-provided `Retry-After`. Defaults to twice
    /// `backoff_max` when unset.
    pub retry_after_max: Option<Duration>,

    /// Headers dropped when a redirect changes host.
    pub remove_headers_on_redirect: Vec<HeaderName>,

    /// Attempt history, oldest first. Grown by `increment`.
    pub history: RetryHistory,
}

impl Default for Retry {
    fn default() -> Self {
        Retry::new(3)
    }
}

impl Retry {
    /// A budget of `total` retries with default policy: idempotent
    /// methods only, no forcelist, no backoff sleep, `Retry-After`
    /// honored.
    pub fn new(total: u32) -> Retry {
        Retry {
            total: Some(total),
            connect: None,
            read: None,
            redirect: None,
            status: None,
            other: None,
            allowed_methods: Some(default_allowed_methods()),
            status_forcelist: HashSet::new(),
            backoff_factor: 0.0,
            backoff_max: DEFAULT_BACKOFF_MAX,
            backoff_jitter: 0.0,
            respect_retry_after_header: true,
            retry_after_max: None,
            remove_headers_on_redirect: vec![header::AUTHORIZATION],
            history: Vec::new(),
        }
    }

    /// No retries at all: the first failure or redirect is terminal.
    pub fn disabled() -> Retry {
        Retry::new(0)
    }

    pub fn history(&self) -> &[RetryEvent] {
        &self.history
    }

    /// Whether `method` may be retried on read/status outcomes.
    pub fn method_retryable(&self, method: &Method) -> bool {
        match &self.allowed_methods {
            Some(set) => set.contains(method),
            None => true,
        }
    }

    /// Whether a response status is grounds for a retry.
    pub(crate) fn is_retry_status(
        &self,
        method: &Method,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> bool {
        if !self.method_retryable(method) {
            return false;
        }
        if self.status_forcelist.contains(&status.as_u16()) {
            return true;
        }
        self.respect_retry_after_header
            && RETRY_AFTER_STATUS_CODES.contains(&status.as_u16())
            && headers.contains_key(header::RETRY_AFTER)
    }

    /// Consume budget for one failed/redirected attempt.
    ///
    /// On success the successor `Retry` carries the grown history. When
    /// any required counter is already zero, the result is
    /// [`Error::MaxRetries`] wrapping the reason and history.
    pub(crate) fn increment(
        &self,
        method: &Method,
        url: &str,
        outcome: AttemptOutcome,
    ) -> Result<Retry, Error> {
        let mut next = self.clone();

        let mut exhausted = decrement(&mut next.total);

        let (reason, event) = match outcome {
            AttemptOutcome::Failed(e) => {
                if e.is_connect_error() {
                    exhausted |= decrement(&mut next.connect);
                } else if e.is_read_error() {
                    if !self.method_retryable(method) {
                        exhausted = true;
                    }
                    exhausted |= decrement(&mut next.read);
                } else {
                    exhausted |= decrement(&mut next.other);
                }
                (
                    e.to_string(),
                    RetryEvent {
                        method: Some(method.clone()),
                        url: url.to_string(),
                        error: Some(e.to_string()),
                        status: None,
                        redirect_location: None,
                    },
                )
            }

            AttemptOutcome::Status(status) => {
                exhausted |= decrement(&mut next.status);
                (
                    format!("too many {} error responses", status.as_u16()),
                    RetryEvent {
                        method: Some(method.clone()),
                        url: url.to_string(),
                        error: None,
                        status: Some(status.as_u16()),
                        redirect_location: None,
                    },
                )
            }

            AttemptOutcome::Redirect { status, location } => {
                exhausted |= decrement(&mut next.redirect);
                (
                    "too many redirects".to_string(),
                    RetryEvent {
                        method: Some(method.clone()),
                        url: url.to_string(),
                        error: None,
                        status: Some(status.as_u16()),
                        redirect_location: Some(location.to_string()),
                    },
                )
            }
        };

        next.history.push(event);

        if exhausted {
            debug!("retry budget exhausted for {}", url);
            return Err(Error::max_retries(url.to_string(), reason, next.history));
        }

        Ok(next)
    }

    /// Exponential backoff for the upcoming sleep.
    ///
    /// `factor × 2^(n−1)` for the n:th consecutive non-redirect retry,
    /// jittered and capped.
    pub fn backoff_duration(&self) -> Duration {
        let consecutive = self
            .history
            .iter()
            .rev()
            .take_while(|e| !e.is_redirect())
            .count();
        if consecutive == 0 {
            return Duration::ZERO;
        }

        let mut secs = self.backoff_factor * 2f64.powi(consecutive as i32 - 1);
        if self.backoff_jitter > 0.0 {
            secs += fastrand::f64() * self.backoff_jitter;
        }
        if secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(secs).min(self.backoff_max)
    }

    /// How long to sleep before the next attempt after a status retry.
    ///
    /// A valid `Retry-After` wins over backoff when honored, capped at
    /// `retry_after_max` (default `2 × backoff_max`).
    pub(crate) fn sleep_duration(&self, response_headers: Option<&HeaderMap>) -> Duration {
        if self.respect_retry_after_header {
            let retry_after = response_headers
                .and_then(|h| h.get(header::RETRY_AFTER))
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            if let Some(d) = retry_after {
                let cap = self.retry_after_max.unwrap_or(self.backoff_max * 2);
                return d.min(cap);
            }
        }
        self.backoff_duration()
    }

    /// Headers to drop when following a redirect.
    pub(crate) fn redirect_strip_headers(
        &self,
        same_host: bool,
        method_rewritten: bool,
    ) -> Vec<HeaderName> {
        let mut strip = Vec::new();
        if !same_host {
            strip.extend(self.remove_headers_on_redirect.iter().cloned());
        }
        if method_rewritten {
            for name in [
                header::AUTHORIZATION,
                header::COOKIE,
                header::PROXY_AUTHORIZATION,
            ] {
                if !strip.contains(&name) {
                    strip.push(name);
                }
            }
        }
        strip
    }
}

fn decrement(counter: &mut Option<u32>) -> bool {
    match counter {
        Some(0) => true,
        Some(n) => {
            *n -= 1;
            false
        }
        None => false,
    }
}

fn default_allowed_methods() -> HashSet<Method> {
    [
        Method::GET,
        Method::HEAD,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
        Method::TRACE,
        Method::PATCH,
    ]
    .into_iter()
    .filter(|m| m.is_idempotent())
    .collect()
}

/// Parse a `Retry-After` value: delta seconds or an HTTP-date.
///
/// Negative or unparseable values count as absent. An HTTP-date in the
/// past means no wait.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<i64>() {
        if secs < 0 {
            return None;
        }
        return Some(Duration::from_secs(secs as u64));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    Some(
        when.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

// //////////////////////////////////////////////////////////////////////////////////////////// REDIRECT

/// How to carry the request over to a redirect target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RedirectPlan {
    pub method: Method,
    pub drop_body: bool,
}

/// The method/body transformation for a redirect, `None` when the
/// response is not a followable redirect status.
///
/// * `303` rewrites to `GET` and drops the body (`HEAD` stays `HEAD`)
/// * `301`/`302` keep `GET`/`HEAD`, anything else becomes `GET` without
///   its body
/// * `307`/`308` preserve method and body unchanged
pub(crate) fn redirect_plan(status: StatusCode, method: &Method) -> Option<RedirectPlan> {
    match status.as_u16() {
        303 => Some(if *method == Method::HEAD {
            RedirectPlan {
                method: Method::HEAD,
                drop_body: true,
            }
        } else {
            RedirectPlan {
                method: Method::GET,
                drop_body: true,
            }
        }),
        301 | 302 => Some(if matches!(*method, Method::GET | Method::HEAD) {
            RedirectPlan {
                method: method.clone(),
                drop_body: false,
            }
        } else {
            RedirectPlan {
                method: Method::GET,
                drop_body: true,
            }
        }),
        307 | 308 => Some(RedirectPlan {
            method: method.clone(),
            drop_body: false,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn headers_with(name: HeaderName, value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(name, value.parse().unwrap());
        h
    }

    #[test]
    fn connect_errors_decrement_connect_and_total() {
        let retry = Retry {
            total: Some(3),
            connect: Some(2),
            ..Retry::new(3)
        };
        let next = retry
            .increment(
                &Method::GET,
                "http://h.test/",
                AttemptOutcome::Failed(&Error::ConnectTimeout),
            )
            .unwrap();
        assert_eq!(next.total, Some(2));
        assert_eq!(next.connect, Some(1));
        assert_eq!(next.history().len(), 1);
        assert!(next.history()[0].error.is_some());
    }

    #[test]
    fn connect_zero_is_terminal() {
        let retry = Retry {
            connect: Some(0),
            ..Retry::new(3)
        };
        let err = retry
            .increment(
                &Method::GET,
                "http://h.test/",
                AttemptOutcome::Failed(&Error::ConnectTimeout),
            )
            .unwrap_err();
        assert!(matches!(err, Error::MaxRetries(_)));
    }

    #[test]
    fn total_exhaustion_wraps_reason_and_history() {
        let retry = Retry::new(1);
        let retry = retry
            .increment(
                &Method::GET,
                "http://h.test/",
                AttemptOutcome::Failed(&Error::ReadTimeout),
            )
            .unwrap();
        let err = retry
            .increment(
                &Method::GET,
                "http://h.test/",
                AttemptOutcome::Failed(&Error::ReadTimeout),
            )
            .unwrap_err();

        match err {
            Error::MaxRetries(detail) => {
                assert_eq!(detail.url, "http://h.test/");
                assert_eq!(detail.history.len(), 2);
                assert!(detail.reason.contains("timeout"));
            }
            other => panic!("expected MaxRetries, got {:?}", other),
        }
    }

    #[test]
    fn read_errors_not_retried_for_non_idempotent_methods() {
        let retry = Retry::new(5);
        let err = retry
            .increment(
                &Method::POST,
                "http://h.test/",
                AttemptOutcome::Failed(&Error::ReadTimeout),
            )
            .unwrap_err();
        assert!(matches!(err, Error::MaxRetries(_)));

        // But connect errors are: no request bytes ever hit the wire.
        assert!(retry
            .increment(
                &Method::POST,
                "http://h.test/",
                AttemptOutcome::Failed(&Error::ConnectTimeout),
            )
            .is_ok());
    }

    #[test]
    fn status_retry_requires_forcelist_or_retry_after() {
        let retry = Retry {
            status_forcelist: [503].into_iter().collect(),
            ..Retry::new(3)
        };
        let empty = HeaderMap::new();

        assert!(retry.is_retry_status(&Method::GET, StatusCode::SERVICE_UNAVAILABLE, &empty));
        assert!(!retry.is_retry_status(&Method::GET, StatusCode::BAD_GATEWAY, &empty));
        // 429 without forcelist but with Retry-After.
        let h = headers_with(header::RETRY_AFTER, "1");
        assert!(retry.is_retry_status(&Method::GET, StatusCode::TOO_MANY_REQUESTS, &h));
        // POST is not in the allowed set.
        assert!(!retry.is_retry_status(&Method::POST, StatusCode::SERVICE_UNAVAILABLE, &empty));
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let mut retry = Retry {
            backoff_factor: 1.0,
            backoff_max: Duration::from_secs(5),
            status_forcelist: [503].into_iter().collect(),
            ..Retry::new(10)
        };

        assert_eq!(retry.backoff_duration(), Duration::ZERO);

        let expected = [1.0f64, 2.0, 4.0, 5.0, 5.0];
        for exp in expected {
            retry = retry
                .increment(
                    &Method::GET,
                    "http://h.test/",
                    AttemptOutcome::Status(StatusCode::SERVICE_UNAVAILABLE),
                )
                .unwrap();
            assert_eq!(retry.backoff_duration(), Duration::from_secs_f64(exp));
        }
    }

    #[test]
    fn backoff_jitter_bounded() {
        let retry = Retry {
            backoff_factor: 1.0,
            backoff_jitter: 0.5,
            ..Retry::new(5)
        };
        let retry = retry
            .increment(
                &Method::GET,
                "http://h.test/",
                AttemptOutcome::Failed(&Error::ConnectTimeout),
            )
            .unwrap();
        for _ in 0..32 {
            let d = retry.backoff_duration();
            assert!(d >= Duration::from_secs(1));
            assert!(d < Duration::from_secs_f64(1.5));
        }
    }

    #[test]
    fn retry_after_integer_and_cap() {
        let retry = Retry {
            backoff_max: Duration::from_secs(5),
            ..Retry::new(3)
        };
        let h = headers_with(header::RETRY_AFTER, "120");
        // Capped at 2 x backoff_max.
        assert_eq!(retry.sleep_duration(Some(&h)), Duration::from_secs(10));

        let h = headers_with(header::RETRY_AFTER, "3");
        assert_eq!(retry.sleep_duration(Some(&h)), Duration::from_secs(3));
    }

    #[test]
    fn retry_after_invalid_falls_back_to_backoff() {
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after("10"), Some(Duration::from_secs(10)));
    }

    #[test]
    fn retry_after_http_date_in_past_means_no_wait() {
        let d = parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        assert_eq!(d, Duration::ZERO);
    }

    #[test]
    fn retry_after_ignored_when_disrespected() {
        let retry = Retry {
            respect_retry_after_header: false,
            ..Retry::new(3)
        };
        let h = headers_with(header::RETRY_AFTER, "60");
        assert_eq!(retry.sleep_duration(Some(&h)), Duration::ZERO);
    }

    #[test]
    fn redirect_plans() {
        let plan = redirect_plan(StatusCode::SEE_OTHER, &Method::POST).unwrap();
        assert_eq!(plan, RedirectPlan { method: Method::GET, drop_body: true });

        let plan = redirect_plan(StatusCode::MOVED_PERMANENTLY, &Method::GET).unwrap();
        assert_eq!(plan, RedirectPlan { method: Method::GET, drop_body: false });

        let plan = redirect_plan(StatusCode::FOUND, &Method::POST).unwrap();
        assert_eq!(plan, RedirectPlan { method: Method::GET, drop_body: true });

        let plan = redirect_plan(StatusCode::TEMPORARY_REDIRECT, &Method::POST).unwrap();
        assert_eq!(plan, RedirectPlan { method: Method::POST, drop_body: false });

        let plan = redirect_plan(StatusCode::PERMANENT_REDIRECT, &Method::PUT).unwrap();
        assert_eq!(plan, RedirectPlan { method: Method::PUT, drop_body: false });

        assert!(redirect_plan(StatusCode::NOT_MODIFIED, &Method::GET).is_none());
        assert!(redirect_plan(StatusCode::OK, &Method::GET).is_none());
    }

    #[test]
    fn strip_headers_on_host_change() {
        let retry = Retry::new(3);

        let strip = retry.redirect_strip_headers(false, false);
        assert_eq!(strip, vec![header::AUTHORIZATION]);

        let strip = retry.redirect_strip_headers(true, false);
        assert!(strip.is_empty());

        let strip = retry.redirect_strip_headers(true, true);
        assert!(strip.contains(&header::AUTHORIZATION));
        assert!(strip.contains(&header::COOKIE));
        assert!(strip.contains(&header::PROXY_AUTHORIZATION));
    }

    #[test]
    fn redirect_events_do_not_inflate_backoff() {
        let retry = Retry {
            backoff_factor: 1.0,
            ..Retry::new(10)
        };
        let retry = retry
            .increment(
                &Method::GET,
                "http://h.test/",
                AttemptOutcome::Failed(&Error::ConnectTimeout),
            )
            .unwrap();
        let retry = retry
            .increment(
                &Method::GET,
                "http://h.test/a",
                AttemptOutcome::Redirect {
                    status: StatusCode::FOUND,
                    location: "/b",
                },
            )
            .unwrap();
        // The redirect resets the consecutive error streak.
        assert_eq!(retry.backoff_duration(), Duration::ZERO);
    }
}
