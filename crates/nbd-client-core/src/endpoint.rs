use crate::error::{DeviceError, DeviceErrorKind, DeviceResult};
use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

/// IANA protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;
/// Protocol number meaning "the family's default for this socket type".
pub const IPPROTO_DEFAULT: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
}

/// Remote server parameters recorded by `connect` so a later reconnect can reuse them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub family: AddressFamily,
    pub socket_type: SocketType,
    pub protocol: u8,
    pub addr: SocketAddr,
}

impl ServerEndpoint {
    /// TCP stream endpoint for `addr`.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        Self {
            family,
            socket_type: SocketType::Stream,
            protocol: IPPROTO_TCP,
            addr,
        }
    }

    /// Decode an endpoint from the raw form a control request carries:
    /// `port (u16 BE) ++ address (4 bytes for Inet, 16 for Inet6)`.
    pub fn from_raw(
        family: AddressFamily,
        socket_type: SocketType,
        protocol: u8,
        bytes: &[u8],
    ) -> DeviceResult<Self> {
        let expected = match family {
            AddressFamily::Inet => 2 + 4,
            AddressFamily::Inet6 => 2 + 16,
        };
        if bytes.len() != expected {
            return Err(DeviceError::with_message(
                DeviceErrorKind::InvalidArgument,
                format!(
                    "{family:?} endpoint needs {expected} address bytes, got {}",
                    bytes.len()
                ),
            ));
        }
        let port = u16::from_be_bytes([bytes[0], bytes[1]]);
        let ip = match family {
            AddressFamily::Inet => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&bytes[2..6]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            AddressFamily::Inet6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[2..18]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };
        Ok(Self {
            family,
            socket_type,
            protocol,
            addr: SocketAddr::new(ip, port),
        })
    }

    /// Inverse of [`ServerEndpoint::from_raw`].
    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18);
        out.extend_from_slice(&self.addr.port().to_be_bytes());
        match self.addr.ip() {
            IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
        }
        out
    }

    /// True when the parameters describe a TCP stream whose family matches the address.
    pub fn is_tcp_stream(&self) -> bool {
        let family_matches = matches!(
            (self.family, self.addr),
            (AddressFamily::Inet, SocketAddr::V4(_)) | (AddressFamily::Inet6, SocketAddr::V6(_))
        );
        family_matches
            && self.socket_type == SocketType::Stream
            && matches!(self.protocol, IPPROTO_DEFAULT | IPPROTO_TCP)
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl From<SocketAddr> for ServerEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

/// Resolve `host:port` to the first address the system resolver returns.
pub async fn resolve(host: &str, port: u16) -> io::Result<ServerEndpoint> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs
        .next()
        .map(ServerEndpoint::from_socket_addr)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {host}:{port}"),
            )
        })
}
