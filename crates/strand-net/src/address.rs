//! Socket addresses
//!
//! One enum over the three families the runtime serves. Conversions to and
//! from raw `sockaddr` storage live here so the socket wrapper never
//! hand-builds a sockaddr itself.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    Ipv4(SocketAddrV4),
    Ipv6(SocketAddrV6),
    Unix(PathBuf),
}

impl Address {
    pub fn ipv4(ip: &str, port: u16) -> Option<Address> {
        ip.parse::<Ipv4Addr>()
            .ok()
            .map(|a| Address::Ipv4(SocketAddrV4::new(a, port)))
    }

    pub fn ipv6(ip: &str, port: u16) -> Option<Address> {
        ip.parse::<Ipv6Addr>()
            .ok()
            .map(|a| Address::Ipv6(SocketAddrV6::new(a, port, 0, 0)))
    }

    /// 0.0.0.0:port
    pub fn any(port: u16) -> Address {
        Address::Ipv4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
    }

    /// 127.0.0.1:port
    pub fn loopback(port: u16) -> Address {
        Address::Ipv4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    pub fn unix(path: impl Into<PathBuf>) -> Address {
        Address::Unix(path.into())
    }

    pub fn family(&self) -> libc::c_int {
        match self {
            Address::Ipv4(_) => libc::AF_INET,
            Address::Ipv6(_) => libc::AF_INET6,
            Address::Unix(_) => libc::AF_UNIX,
        }
    }

    /// Port for inet addresses, None for unix-domain.
    pub fn port(&self) -> Option<u16> {
        match self {
            Address::Ipv4(a) => Some(a.port()),
            Address::Ipv6(a) => Some(a.port()),
            Address::Unix(_) => None,
        }
    }

    pub fn set_port(&mut self, port: u16) {
        match self {
            Address::Ipv4(a) => a.set_port(port),
            Address::Ipv6(a) => a.set_port(port),
            Address::Unix(_) => {}
        }
    }

    /// Raw form for bind/connect/sendto.
    pub fn to_sockaddr(&self) -> (libc::sockaddr_storage, libc::socklen_t) {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        match self {
            Address::Ipv4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from(*a.ip()).to_be(),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
                }
                (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
            }
            Address::Ipv6(a) => {
                let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = a.port().to_be();
                sin6.sin6_addr.s6_addr = a.ip().octets();
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
                }
                (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
            }
            Address::Unix(path) => {
                let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
                sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
                let bytes = path.as_os_str().as_encoded_bytes();
                let max = sun.sun_path.len() - 1;
                let n = bytes.len().min(max);
                for (i, b) in bytes.iter().take(n).enumerate() {
                    sun.sun_path[i] = *b as libc::c_char;
                }
                let len = std::mem::size_of::<libc::sa_family_t>() + n + 1;
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_un, sun);
                }
                (storage, len as libc::socklen_t)
            }
        }
    }

    /// Parse a kernel-filled sockaddr (getsockname/getpeername/accept).
    pub fn from_sockaddr(storage: &libc::sockaddr_storage) -> Option<Address> {
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                Some(Address::Ipv4(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                    u16::from_be(sin.sin_port),
                )))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                Some(Address::Ipv6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    0,
                    0,
                )))
            }
            libc::AF_UNIX => {
                let sun = unsafe { &*(storage as *const _ as *const libc::sockaddr_un) };
                let end = sun
                    .sun_path
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(sun.sun_path.len());
                let bytes: Vec<u8> = sun.sun_path[..end].iter().map(|&c| c as u8).collect();
                Some(Address::Unix(PathBuf::from(
                    String::from_utf8_lossy(&bytes).into_owned(),
                )))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(a) => write!(f, "{}", a),
            Address::Ipv6(a) => write!(f, "{}", a),
            Address::Unix(p) => write!(f, "{}", p.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let a = Address::ipv4("127.0.0.1", 8080).unwrap();
        assert_eq!(a.to_string(), "127.0.0.1:8080");
        assert_eq!(a.port(), Some(8080));
        assert_eq!(a.family(), libc::AF_INET);
        assert!(Address::ipv4("not-an-ip", 1).is_none());

        let b = Address::ipv6("::1", 80).unwrap();
        assert_eq!(b.to_string(), "[::1]:80");
        assert_eq!(b.family(), libc::AF_INET6);
    }

    #[test]
    fn test_sockaddr_roundtrip_v4() {
        let a = Address::ipv4("10.1.2.3", 4242).unwrap();
        let (storage, len) = a.to_sockaddr();
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in>());
        assert_eq!(Address::from_sockaddr(&storage), Some(a));
    }

    #[test]
    fn test_sockaddr_roundtrip_v6() {
        let a = Address::ipv6("fe80::1", 9).unwrap();
        let (storage, _len) = a.to_sockaddr();
        assert_eq!(Address::from_sockaddr(&storage), Some(a));
    }

    #[test]
    fn test_sockaddr_roundtrip_unix() {
        let a = Address::unix("/tmp/strand-test.sock");
        let (storage, _len) = a.to_sockaddr();
        assert_eq!(Address::from_sockaddr(&storage), Some(a));
    }

    #[test]
    fn test_set_port() {
        let mut a = Address::any(0);
        a.set_port(1234);
        assert_eq!(a.port(), Some(1234));
    }
}
