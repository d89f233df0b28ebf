//! Connected UDP transport for the bound states.
//!
//! Once a lease is accepted the client has a routable address and renewal
//! traffic is plain unicast UDP; the kernel's demux replaces the packet
//! filter.

use crate::proto::{CLIENT_PORT, SERVER_PORT};
use crate::{Error, Result};
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::trace;

const RECV_BUF_SIZE: usize = 4096;

/// Bound-mode socket: `client_ip:68` connected to `server:67` on one
/// interface.
pub struct BoundUdpSocket {
    fd: RawFd,
}

impl BoundUdpSocket {
    pub fn open(ifindex: i32, local: Ipv4Addr, server: Ipv4Addr) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let sock = Self { fd };

        let idx: libc::c_int = ifindex;
        let ret = unsafe {
            libc::setsockopt(
                sock.fd,
                libc::SOL_SOCKET,
                libc::SO_BINDTOIFINDEX,
                &idx as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let on: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                sock.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let local_addr = sockaddr_in(local, CLIENT_PORT);
        let ret = unsafe {
            libc::bind(
                sock.fd,
                &local_addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let server_addr = sockaddr_in(server, SERVER_PORT);
        let ret = unsafe {
            libc::connect(
                sock.fd,
                &server_addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        trace!(ifindex, %local, %server, "bound udp socket open");
        Ok(sock)
    }

    /// Single best-effort send of one DHCP payload to the connected server.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let ret = unsafe {
            libc::send(
                self.fd,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Next datagram payload, or `None` once drained.
    pub fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut buf = [0u8; RECV_BUF_SIZE];
        loop {
            let n = unsafe {
                libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => Ok(None),
                    _ => Err(Error::Io(err)),
                };
            }
            return Ok(Some(buf[..n as usize].to_vec()));
        }
    }
}

impl AsRawFd for BoundUdpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for BoundUdpSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn sockaddr_in(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(ip.octets()),
        },
        sin_zero: [0; 8],
    }
}
