//! Network endpoints and their sockaddr representation.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use corio_core::{ErrorCode, IoResult};

/// An IP address plus port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    addr: SocketAddr,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            addr: SocketAddr::new(ip, port),
        }
    }

    /// Parse `"ip:port"` (with `[..]` brackets for IPv6).
    pub fn parse(text: &str) -> IoResult<Self> {
        text.parse::<SocketAddr>()
            .map(|addr| Self { addr })
            .map_err(|_| ErrorCode::InvalidArgument)
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn is_v6(&self) -> bool {
        self.addr.is_ipv6()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Encode into sockaddr storage for the kernel.
    pub(crate) fn to_storage(&self) -> (libc::sockaddr_storage, libc::socklen_t) {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = match self.addr {
            SocketAddr::V4(v4) => {
                let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
                unsafe {
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = v4.port().to_be();
                    (*sin).sin_addr.s_addr = u32::from(*v4.ip()).to_be();
                }
                std::mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
                unsafe {
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = v6.port().to_be();
                    (*sin6).sin6_flowinfo = v6.flowinfo();
                    (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                    (*sin6).sin6_scope_id = v6.scope_id();
                }
                std::mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as libc::socklen_t)
    }

    /// Decode kernel-written sockaddr storage.
    pub(crate) fn from_storage(
        storage: &libc::sockaddr_storage,
        len: libc::socklen_t,
    ) -> IoResult<Self> {
        match storage.ss_family as i32 {
            libc::AF_INET => {
                if (len as usize) < std::mem::size_of::<libc::sockaddr_in>() {
                    return Err(ErrorCode::InvalidArgument);
                }
                let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Ok(Self::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
            }
            libc::AF_INET6 => {
                if (len as usize) < std::mem::size_of::<libc::sockaddr_in6>() {
                    return Err(ErrorCode::InvalidArgument);
                }
                let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Ok(Self::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
            }
            _ => Err(ErrorCode::InvalidArgument),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}
