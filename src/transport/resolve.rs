//! Name resolution seam.
//!
//! DNS is an external collaborator: the engine only needs
//! `resolve(host, port, family) -> [addrs]`. The default implementation
//! goes through the system resolver via `ToSocketAddrs`.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::Error;

/// Address family preference for resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FamilyPref {
    /// Use whatever the resolver returns, in its order.
    #[default]
    Any,
    /// IPv4 addresses only.
    V4,
    /// IPv6 addresses only.
    V6,
}

/// Resolves a host name to socket addresses.
pub trait Resolver: Send + Sync + fmt::Debug {
    fn resolve(&self, host: &str, port: u16, family: FamilyPref)
        -> Result<Vec<SocketAddr>, Error>;
}

/// System resolver (`getaddrinfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct GaiResolver;

impl Resolver for GaiResolver {
    fn resolve(
        &self,
        host: &str,
        port: u16,
        family: FamilyPref,
    ) -> Result<Vec<SocketAddr>, Error> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Resolve(format!("{}: {}", host, e)))?;

        let addrs: Vec<SocketAddr> = addrs
            .filter(|a| match family {
                FamilyPref::Any => true,
                FamilyPref::V4 => a.is_ipv4(),
                FamilyPref::V6 => a.is_ipv6(),
            })
            .collect();

        if addrs.is_empty() {
            return Err(Error::Resolve(format!("no usable address for {}", host)));
        }

        Ok(addrs)
    }
}
