//! Manager of per-origin pools.
//!
//! The manager derives a [`PoolKey`] for every request, finds or creates
//! the per-origin pool in an LRU map bounded by `num_pools` (evicted
//! pools are closed), decides the proxy routing, and drives the retry
//! and redirect controller around single attempts.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use http::{header, HeaderMap, Method};
use parking_lot::Mutex;
use url::Url;

use crate::conn::{ConnConfig, Connection, HostPort, Scheme};
use crate::decode;
use crate::ext::UrlExt;
use crate::pool::{LruMap, Pool, PoolConfig, PoolKey};
use crate::request::{Body, PreparedRequest, RequestDefaults, RequestSpec};
use crate::response::Response;
use crate::retry::{redirect_plan, AttemptOutcome, Retry};
use crate::timeout::{Deadline, Timeout};
use crate::transport::{FamilyPref, Resolver, TlsSetup};
use crate::url::{parse_url, redirect_target, same_host};
use crate::Error;

/// How the request reaches its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Straight to the origin.
    Direct,
    /// Through a forward proxy with an absolute-form request target.
    Forward,
    /// Through a CONNECT tunnel.
    Tunnel,
}

/// Forward/CONNECT proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    url: Url,
    headers: HeaderMap,
    /// Send https requests in absolute form over an https proxy instead
    /// of tunneling.
    pub use_forwarding_for_https: bool,
}

impl ProxyConfig {
    /// Parse a proxy URL. Userinfo becomes `Proxy-Authorization`.
    pub fn new(url: &str) -> Result<ProxyConfig, Error> {
        let url = parse_url(url)?;
        let mut headers = HeaderMap::new();
        if let Some(auth) = url.basic_auth() {
            headers.insert(header::PROXY_AUTHORIZATION, auth);
        }
        Ok(ProxyConfig {
            url,
            headers,
            use_forwarding_for_https: false,
        })
    }

    /// Extra headers for the CONNECT or forward request. Never applied
    /// to tunneled inner requests.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn host_port(&self) -> Result<HostPort, Error> {
        HostPort::from_url(&self.url)
    }

    fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }
}

struct ManagerConfig {
    pool: PoolConfig,
    timeout: Timeout,
    retries: Retry,
    redirect: bool,
    preload_content: bool,
    decode_content: bool,
    decode_max_bytes: Option<u64>,
    max_encodings: usize,
    headers: HeaderMap,
    user_agent: String,
    proxy: Option<ProxyConfig>,
}

struct ManagerInner {
    pools: Mutex<LruMap<PoolKey, Pool>>,
    config: ManagerConfig,
    conn_config: Arc<ConnConfig>,
}

/// Thread-safe, pooled, retry-aware request entry point.
///
/// Cheap to clone; clones share the pools.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<ManagerInner>,
}

/// Per-request overrides of the manager defaults.
#[derive(Debug, Default)]
pub struct RequestOptions {
    pub headers: Option<HeaderMap>,
    pub retries: Option<Retry>,
    pub timeout: Option<Timeout>,
    pub redirect: Option<bool>,
    pub preload_content: Option<bool>,
    pub decode_content: Option<bool>,
}

impl Default for PoolManager {
    fn default() -> Self {
        PoolManager::new()
    }
}

impl PoolManager {
    /// A manager with default configuration.
    pub fn new() -> PoolManager {
        ManagerBuilder::new().build()
    }

    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    /// Number of per-origin pools currently alive.
    pub fn pools_len(&self) -> usize {
        self.inner.pools.lock().len()
    }

    /// Close every pool and their idle connections.
    pub fn close(&self) {
        let pools = self.inner.pools.lock().clear();
        for pool in pools {
            pool.close();
        }
    }

    /// The pool serving `url`, creating it when absent.
    pub fn pool_for_url(&self, url: &Url) -> Result<Pool, Error> {
        let (route, target) = self.route_for(url)?;
        self.pool_for(url, route, target)
    }

    /// The pool serving an origin given as parts.
    pub fn pool_for_host(&self, scheme: Scheme, host: &str, port: u16) -> Result<Pool, Error> {
        let url = parse_url(&format!("{}://{}:{}/", scheme.as_str(), host, port))?;
        self.pool_for_url(&url)
    }

    /// Issue a request with manager defaults and no body.
    pub fn request(&self, method: Method, url: &str) -> Result<Response, Error> {
        self.urlopen(method, url, Body::empty(), RequestOptions::default())
    }

    /// Issue a request.
    ///
    /// This is the single entry point the retry/redirect controller
    /// wraps. The returned response has streamed its body only when
    /// `preload_content` is disabled.
    pub fn urlopen(
        &self,
        method: Method,
        url: &str,
        body: Body,
        opts: RequestOptions,
    ) -> Result<Response, Error> {
        let config = &self.inner.config;

        let url = parse_url(url)?;
        let timeout = opts.timeout.unwrap_or(config.timeout);
        let deadline = timeout.start();
        let mut retry = opts.retries.unwrap_or_else(|| config.retries.clone());
        let redirect_enabled = opts.redirect.unwrap_or(config.redirect);
        let preload = opts.preload_content.unwrap_or(config.preload_content);
        let decode = opts.decode_content.unwrap_or(config.decode_content);

        let defaults = RequestDefaults {
            user_agent: config.user_agent.clone(),
            headers: config.headers.clone(),
            decode_content: decode,
        };

        let mut spec = RequestSpec::new(method, url, opts.headers.unwrap_or_default(), body);

        loop {
            let outcome = self.single_attempt(&mut spec, &defaults, &deadline, decode);

            let mut response = match outcome {
                Err(e) => {
                    if e.is_never_retried() {
                        return Err(e);
                    }
                    retry = retry.increment(
                        &spec.method,
                        spec.url.as_str(),
                        AttemptOutcome::Failed(&e),
                    )?;
                    if !spec.body.reset() {
                        // A partly sent streaming body cannot be replayed.
                        return Err(e);
                    }
                    self.sleep_within(&deadline, retry.backoff_duration());
                    continue;
                }
                Ok(response) => response,
            };

            // Redirect?
            if redirect_enabled {
                if let Some(location) = response.location() {
                    if let Some(plan) = redirect_plan(response.status(), &spec.method) {
                        let target = redirect_target(&spec.url, &location)?;

                        if !plan.drop_body && !spec.body.reset() {
                            // 307/308 with a consumed streaming body: hand
                            // the redirect to the caller instead.
                            response.set_retries(retry);
                            return Ok(response);
                        }

                        retry = match retry.increment(
                            &spec.method,
                            spec.url.as_str(),
                            AttemptOutcome::Redirect {
                                status: response.status(),
                                location: &location,
                            },
                        ) {
                            Ok(r) => r,
                            Err(e) => {
                                response.release();
                                return Err(e);
                            }
                        };

                        let strip = retry.redirect_strip_headers(
                            same_host(&spec.url, &target),
                            plan.method != spec.method,
                        );
                        debug!(
                            "following {} redirect to {}",
                            response.status(),
                            target
                        );
                        response.release();
                        spec.redirect_to(target, plan.method, plan.drop_body, &strip);
                        continue;
                    }
                }
            }

            // Status retry?
            if retry.is_retry_status(&spec.method, response.status(), response.headers()) {
                let sleep = retry.sleep_duration(Some(response.headers()));
                retry = match retry.increment(
                    &spec.method,
                    spec.url.as_str(),
                    AttemptOutcome::Status(response.status()),
                ) {
                    Ok(r) => r,
                    Err(e) => {
                        response.release();
                        return Err(e);
                    }
                };
                if !spec.body.reset() {
                    response.set_retries(retry);
                    return Ok(response);
                }
                debug!(
                    "retrying {} after {} response, sleeping {:?}",
                    spec.url,
                    response.status(),
                    sleep
                );
                response.release();
                self.sleep_within(&deadline, sleep);
                continue;
            }

            response.set_retries(retry);
            if preload {
                response.preload()?;
            }
            return Ok(response);
        }
    }

    /// Lease, connect, send, read head: one attempt against one pool.
    fn single_attempt(
        &self,
        spec: &mut RequestSpec,
        defaults: &RequestDefaults,
        deadline: &Deadline,
        decode: bool,
    ) -> Result<Response, Error> {
        let config = &self.inner.config;

        let (route, target) = self.route_for(&spec.url)?;
        let pool = self.pool_for(&spec.url, route, target)?;

        let mut conn = pool.lease(deadline.connect_timeout()?)?;

        let head = match self.drive_attempt(&mut conn, spec, defaults, deadline, route) {
            Ok(head) => head,
            Err(e) => {
                conn.close();
                pool.release(conn);
                return Err(e);
            }
        };

        Response::new(
            head,
            conn,
            pool.handle(),
            *deadline,
            spec.url.clone(),
            decode,
            config.max_encodings,
            config.decode_max_bytes,
        )
    }

    fn drive_attempt(
        &self,
        conn: &mut Connection,
        spec: &mut RequestSpec,
        defaults: &RequestDefaults,
        deadline: &Deadline,
        route: Route,
    ) -> Result<http::Response<()>, Error> {
        let config = &self.inner.config;

        if conn.is_unconnected() {
            if route == Route::Tunnel {
                let origin = HostPort::from_url(&spec.url)?;
                let proxy = config.proxy.as_ref().expect("tunnel route has a proxy");
                conn.set_tunnel(origin.host, origin.port, origin.scheme, proxy.headers.clone())?;
            }
            conn.connect(deadline)?;
        }

        let extra = match route {
            Route::Forward => config.proxy.as_ref().map(|p| &p.headers),
            _ => None,
        };

        let mut prepared: PreparedRequest =
            spec.prepare(defaults, extra, route == Route::Forward)?;
        conn.send_request(&mut prepared, deadline)?;
        conn.read_response_head(deadline)
    }

    fn route_for(&self, url: &Url) -> Result<(Route, HostPort), Error> {
        let origin = HostPort::from_url(url)?;
        let proxy = match &self.inner.config.proxy {
            None => return Ok((Route::Direct, origin)),
            Some(p) => p,
        };

        let proxy_target = proxy.host_port()?;
        let route = match origin.scheme {
            Scheme::Http => Route::Forward,
            Scheme::Https => {
                if proxy.is_https() && proxy.use_forwarding_for_https {
                    Route::Forward
                } else {
                    Route::Tunnel
                }
            }
        };
        Ok((route, proxy_target))
    }

    fn pool_for(&self, url: &Url, route: Route, target: HostPort) -> Result<Pool, Error> {
        let config = &self.inner.config;

        let proxy = match route {
            Route::Direct => None,
            _ => config
                .proxy
                .as_ref()
                .map(|p| (&p.url, &p.headers)),
        };
        let key = PoolKey::derive(url, proxy, self.inner.conn_config.tls.as_ref())?;

        let mut pools = self.inner.pools.lock();
        let (pool, evicted) = pools.get_or_insert_with(key.clone(), || {
            debug!("new pool for {:?}", key);
            Pool::new(
                key.clone(),
                target,
                config.pool.clone(),
                self.inner.conn_config.clone(),
            )
        });
        drop(pools);

        if let Some(evicted) = evicted {
            debug!("evicting {:?}", evicted);
            evicted.close();
        }

        Ok(pool)
    }

    fn sleep_within(&self, deadline: &Deadline, wanted: Duration) {
        if wanted.is_zero() {
            return;
        }
        let capped = match deadline.total_remaining() {
            Some(rem) => wanted.min(rem),
            None => wanted,
        };
        if !capped.is_zero() {
            thread::sleep(capped);
        }
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////// BUILDER

/// Builder for [`PoolManager`].
pub struct ManagerBuilder {
    num_pools: usize,
    pool: PoolConfig,
    conn: ConnConfig,
    timeout: Timeout,
    retries: Retry,
    redirect: bool,
    preload_content: bool,
    decode_content: bool,
    decode_max_bytes: Option<u64>,
    max_encodings: usize,
    headers: HeaderMap,
    user_agent: String,
    proxy: Option<ProxyConfig>,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        ManagerBuilder::new()
    }
}

impl ManagerBuilder {
    pub fn new() -> ManagerBuilder {
        ManagerBuilder {
            num_pools: 10,
            pool: PoolConfig::default(),
            conn: ConnConfig::default(),
            timeout: Timeout::NONE,
            retries: Retry::default(),
            redirect: true,
            preload_content: true,
            decode_content: true,
            decode_max_bytes: None,
            max_encodings: decode::DEFAULT_MAX_ENCODINGS,
            headers: HeaderMap::new(),
            user_agent: concat!("poolreq/", env!("CARGO_PKG_VERSION")).to_string(),
            proxy: None,
        }
    }

    /// LRU capacity for per-origin pools.
    pub fn num_pools(mut self, n: usize) -> Self {
        self.num_pools = n.max(1);
        self
    }

    /// Idle connections kept per origin.
    pub fn maxsize(mut self, n: usize) -> Self {
        self.pool.maxsize = n.max(1);
        self
    }

    /// Make saturated pools wait on lease instead of opening overflow
    /// connections.
    pub fn block(mut self, block: bool) -> Self {
        self.pool.block = block;
        self
    }

    /// Default request time budgets.
    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Default retry policy.
    pub fn retries(mut self, retries: Retry) -> Self {
        self.retries = retries;
        self
    }

    /// Follow redirects automatically.
    pub fn redirect(mut self, on: bool) -> Self {
        self.redirect = on;
        self
    }

    /// Read bodies into memory before returning responses.
    pub fn preload_content(mut self, on: bool) -> Self {
        self.preload_content = on;
        self
    }

    /// Transparently decode `Content-Encoding`.
    pub fn decode_content(mut self, on: bool) -> Self {
        self.decode_content = on;
        self
    }

    /// Cap cumulative decoded body bytes.
    pub fn decode_max_bytes(mut self, max: u64) -> Self {
        self.decode_max_bytes = Some(max);
        self
    }

    /// Default headers merged into every request at lowest precedence.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Route requests through a proxy.
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// TLS provider and parameters for https origins and proxies.
    pub fn tls(mut self, tls: TlsSetup) -> Self {
        self.conn.tls = Some(tls);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.conn.resolver = resolver;
        self
    }

    pub fn family(mut self, family: FamilyPref) -> Self {
        self.conn.family = family;
        self
    }

    /// Aggregate cap on response head bytes.
    pub fn max_header_size(mut self, n: usize) -> Self {
        self.conn.max_header_size = n;
        self
    }

    /// Cap on a single chunk of a chunked response.
    pub fn max_chunk_size(mut self, n: u64) -> Self {
        self.conn.max_chunk_size = n;
        self
    }

    pub fn build(self) -> PoolManager {
        PoolManager {
            inner: Arc::new(ManagerInner {
                pools: Mutex::new(LruMap::new(self.num_pools)),
                conn_config: Arc::new(self.conn),
                config: ManagerConfig {
                    pool: self.pool,
                    timeout: self.timeout,
                    retries: self.retries,
                    redirect: self.redirect,
                    preload_content: self.preload_content,
                    decode_content: self.decode_content,
                    decode_max_bytes: self.decode_max_bytes,
                    max_encodings: self.max_encodings,
                    headers: self.headers,
                    user_agent: self.user_agent,
                    proxy: self.proxy,
                },
            }),
        }
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////// GLOBAL

static DEFAULT_MANAGER: std::sync::OnceLock<Mutex<Option<PoolManager>>> =
    std::sync::OnceLock::new();

fn default_manager_slot() -> &'static Mutex<Option<PoolManager>> {
    DEFAULT_MANAGER.get_or_init(|| Mutex::new(None))
}

/// The process-wide manager, created on first use.
///
/// Embedders that want full control simply construct their own
/// [`PoolManager`] and never touch this one.
pub fn default_manager() -> PoolManager {
    let mut slot = default_manager_slot().lock();
    slot.get_or_insert_with(PoolManager::new).clone()
}

/// Replace the process-wide manager. The previous one, if any, is closed.
pub fn set_default_manager(manager: PoolManager) {
    let mut slot = default_manager_slot().lock();
    if let Some(old) = slot.replace(manager) {
        old.close();
    }
}
