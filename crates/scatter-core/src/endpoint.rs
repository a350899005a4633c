//! Endpoint — an IPv4 address and UDP port.
//!
//! Every peer in the fleet is named by one of these. Ordering is by
//! (address, port), which is also the iteration order of the peer table.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    address: u32,
    port: u16,
}

impl Endpoint {
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self {
            address: u32::from(address),
            port,
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.address)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// An endpoint is usable only if both halves are non-zero.
    pub fn is_valid(&self) -> bool {
        self.address != 0 && self.port != 0
    }

    /// Hash contribution that is identical on every node and every build.
    pub fn stable_hash(&self) -> u64 {
        (u64::from(self.address) << 16) | u64::from(self.port)
    }

    /// Bytes fed to the ring hash for virtual replica `index`.
    pub fn replica_key(&self, index: u32) -> [u8; 10] {
        let mut key = [0u8; 10];
        key[0..4].copy_from_slice(&self.address.to_be_bytes());
        key[4..6].copy_from_slice(&self.port.to_le_bytes());
        key[6..10].copy_from_slice(&index.to_le_bytes());
        key
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address(), self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address(), self.port)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let addr: SocketAddrV4 = trimmed
            .parse()
            .map_err(|_| EndpointError::Malformed(trimmed.to_string()))?;
        Ok(Self::new(*addr.ip(), addr.port()))
    }
}

impl TryFrom<SocketAddr> for Endpoint {
    type Error = EndpointError;

    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(Self::new(*v4.ip(), v4.port())),
            SocketAddr::V6(_) => Err(EndpointError::Ipv6Unsupported(addr)),
        }
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("malformed endpoint {0:?}, expected ipv4_address:port")]
    Malformed(String),

    #[error("IPv6 endpoints are not supported: {0}")]
    Ipv6Unsupported(SocketAddr),
}
