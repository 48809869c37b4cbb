//! Pool key derivation.
//!
//! Two requests may share a connection iff every option that changes the
//! bytes on the wire of a reused socket is identical: origin, proxy route,
//! proxy headers and the complete TLS parameter set. Per-request options
//! (headers, retries, timeouts, redirect policy) deliberately stay out.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use http::HeaderMap;
use url::Url;

use crate::conn::{HostPort, Scheme};
use crate::transport::{TlsConfig, TlsSetup};
use crate::Error;

/// TLS material of a pool key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TlsKey {
    pub config: TlsConfig,
    pub provider_identity: u64,
}

/// Identity of a per-origin pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Canonical proxy URL, when routed through one.
    pub proxy: Option<String>,
    /// Digest of the extra proxy headers, when routed through one.
    pub proxy_headers_digest: Option<u64>,
    /// TLS parameters, when any hop of the route handshakes.
    pub tls: Option<TlsKey>,
}

impl PoolKey {
    /// Derive the key for a request URL under the given routing.
    pub(crate) fn derive(
        url: &Url,
        proxy: Option<(&Url, &HeaderMap)>,
        tls: Option<&TlsSetup>,
    ) -> Result<PoolKey, Error> {
        let origin = HostPort::from_url(url)?;

        let proxy_is_https = proxy
            .map(|(u, _)| u.scheme() == "https")
            .unwrap_or(false);
        let tls_in_play = origin.scheme == Scheme::Https || proxy_is_https;

        Ok(PoolKey {
            scheme: origin.scheme,
            host: origin.host,
            port: origin.port,
            proxy: proxy.map(|(u, _)| u.as_str().to_string()),
            proxy_headers_digest: proxy.map(|(_, h)| digest_headers(h)),
            tls: match (tls_in_play, tls) {
                (true, Some(setup)) => Some(TlsKey {
                    config: setup.config.clone(),
                    provider_identity: setup.provider.identity(),
                }),
                _ => None,
            },
        })
    }

    #[cfg(test)]
    pub(crate) fn for_origin(scheme: Scheme, host: &str, port: u16) -> PoolKey {
        PoolKey {
            scheme,
            host: host.to_string(),
            port,
            proxy: None,
            proxy_headers_digest: None,
            tls: None,
        }
    }
}

/// Order-insensitive digest of a header map.
fn digest_headers(headers: &HeaderMap) -> u64 {
    let mut rows: Vec<(&str, &[u8])> = headers
        .iter()
        .map(|(n, v)| (n.as_str(), v.as_bytes()))
        .collect();
    rows.sort();

    let mut hasher = DefaultHasher::new();
    for (name, value) in rows {
        name.hash(&mut hasher);
        value.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::{TlsProvider, VerifyMode};
    use crate::url::parse_url;
    use std::sync::Arc;

    #[derive(Debug)]
    struct NullProvider(u64);

    impl TlsProvider for NullProvider {
        fn wrap(
            &self,
            _inner: Box<dyn crate::transport::Transport>,
            _server_hostname: &str,
            _alpn: Option<&[&str]>,
            _config: &TlsConfig,
        ) -> Result<Box<dyn crate::transport::Transport>, Error> {
            Err(Error::Tls("test provider".into()))
        }

        fn identity(&self) -> u64 {
            self.0
        }
    }

    fn setup(identity: u64, config: TlsConfig) -> TlsSetup {
        TlsSetup {
            provider: Arc::new(NullProvider(identity)),
            config,
        }
    }

    #[test]
    fn same_origin_same_key() {
        let a = parse_url("http://h.test/a").unwrap();
        let b = parse_url("http://h.test/b?q=1").unwrap();
        let ka = PoolKey::derive(&a, None, None).unwrap();
        let kb = PoolKey::derive(&b, None, None).unwrap();
        assert_eq!(ka, kb);
    }

    #[test]
    fn scheme_port_and_host_split_pools() {
        let base = PoolKey::derive(&parse_url("http://h.test/").unwrap(), None, None).unwrap();
        for other in [
            "https://h.test/",
            "http://h.test:8080/",
            "http://other.test/",
        ] {
            let k = PoolKey::derive(&parse_url(other).unwrap(), None, None).unwrap();
            assert_ne!(base, k, "{} must not share a pool", other);
        }
    }

    #[test]
    fn proxy_and_proxy_headers_split_pools() {
        let url = parse_url("http://h.test/").unwrap();
        let proxy = parse_url("http://p.test:3128/").unwrap();

        let direct = PoolKey::derive(&url, None, None).unwrap();
        let empty = HeaderMap::new();
        let proxied = PoolKey::derive(&url, Some((&proxy, &empty)), None).unwrap();
        assert_ne!(direct, proxied);

        let mut headers = HeaderMap::new();
        headers.insert("proxy-authorization", "Basic xyz".parse().unwrap());
        let with_auth = PoolKey::derive(&url, Some((&proxy, &headers)), None).unwrap();
        assert_ne!(proxied, with_auth);
    }

    #[test]
    fn tls_identity_and_config_split_pools() {
        let url = parse_url("https://h.test/").unwrap();

        let a = PoolKey::derive(&url, None, Some(&setup(1, TlsConfig::default()))).unwrap();
        let b = PoolKey::derive(&url, None, Some(&setup(2, TlsConfig::default()))).unwrap();
        assert_ne!(a, b);

        let insecure = TlsConfig {
            verify: VerifyMode::Disabled,
            ..TlsConfig::default()
        };
        let c = PoolKey::derive(&url, None, Some(&setup(1, insecure))).unwrap();
        assert_ne!(a, c);

        let client_cert = TlsConfig {
            client_cert_id: Some("cert-a".into()),
            ..TlsConfig::default()
        };
        let d = PoolKey::derive(&url, None, Some(&setup(1, client_cert))).unwrap();
        assert_ne!(a, d);
    }

    #[test]
    fn tls_config_irrelevant_for_plain_http() {
        let url = parse_url("http://h.test/").unwrap();
        let a = PoolKey::derive(&url, None, Some(&setup(1, TlsConfig::default()))).unwrap();
        let b = PoolKey::derive(&url, None, None).unwrap();
        assert_eq!(a, b);
    }
}
