//! TLS seam.
//!
//! TLS primitives are an external collaborator. The engine consumes a
//! configured [`TlsProvider`] whose `wrap` turns any established transport
//! into a TLS transport, which is also what makes CONNECT tunnels with an
//! HTTPS proxy work: the inner handshake wraps the already-TLS proxy hop.
//!
//! Every knob in [`TlsConfig`] changes the bytes on the wire of a
//! handshake, so the whole struct participates in pool key derivation.

use std::fmt;
use std::sync::Arc;

use crate::transport::Transport;
use crate::Error;

/// Certificate verification mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VerifyMode {
    /// Verify the peer certificate and host name.
    #[default]
    Full,
    /// No verification. The engine logs a warning for every HTTPS
    /// request made with verification disabled.
    Disabled,
}

/// TLS protocol versions for min/max bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// Provider-independent TLS parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TlsConfig {
    pub verify: VerifyMode,
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
    /// OpenSSL-style cipher list, when the provider supports one.
    pub ciphers: Option<String>,
    /// Identifies the CA bundle in use (a path or a digest).
    pub ca_bundle_id: Option<String>,
    /// Identifies the client certificate in use (a path or a digest).
    pub client_cert_id: Option<String>,
    /// SNI/verification host override.
    pub server_hostname_override: Option<String>,
}

/// Wraps established transports in TLS.
pub trait TlsProvider: Send + Sync + fmt::Debug {
    /// Perform the handshake over `inner` and return the wrapped stream.
    ///
    /// `server_hostname` is the SNI/verification name. Handshake and
    /// verification failures are [`Error::Tls`].
    fn wrap(
        &self,
        inner: Box<dyn Transport>,
        server_hostname: &str,
        alpn: Option<&[&str]>,
        config: &TlsConfig,
    ) -> Result<Box<dyn Transport>, Error>;

    /// Distinguishes provider instances that produce different handshakes
    /// from the same [`TlsConfig`] (e.g. a custom trust store). Feeds the
    /// pool key.
    fn identity(&self) -> u64 {
        0
    }
}

/// A provider plus its parameters, as configured on a manager.
#[derive(Debug, Clone)]
pub struct TlsSetup {
    pub provider: Arc<dyn TlsProvider>,
    pub config: TlsConfig,
}

impl TlsSetup {
    /// The host name to hand the provider, honoring the override.
    pub(crate) fn hostname<'a>(&'a self, default: &'a str) -> &'a str {
        self.config
            .server_hostname_override
            .as_deref()
            .unwrap_or(default)
    }
}
