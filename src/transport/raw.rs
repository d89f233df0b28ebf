//! AF_PACKET transport for the unbound states.
//!
//! Sends broadcast IP+UDP+DHCP datagrams and receives BOOTP replies before
//! the interface has an address. The kernel filter from [`super::filter`] is
//! attached at creation (it is parameterized by xid, so each probe opens its
//! own socket) and PACKET_AUXDATA reports whether the kernel already
//! validated the UDP checksum.

use super::checksum::{ip_checksum, udp_checksum, udp_checksum_ok};
use super::filter;
use crate::proto::{CLIENT_PORT, SERVER_PORT};
use crate::{Error, Result};
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, trace};

// linux/if_packet.h tp_status bits relevant to receive
const TP_STATUS_CSUMNOTREADY: u32 = 1 << 3;
const TP_STATUS_CSUM_VALID: u32 = 1 << 7;

const RECV_BUF_SIZE: usize = 4096;

/// Raw-mode socket: link-layer datagrams on one interface, filtered to the
/// probe's transaction id.
pub struct RawSocket {
    fd: RawFd,
    ifindex: i32,
    broadcast_hw: Vec<u8>,
    strict_destination: bool,
}

impl RawSocket {
    pub fn open(
        ifindex: i32,
        xid: u32,
        broadcast_hw: &[u8],
        strict_destination: bool,
    ) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let sock = Self {
            fd,
            ifindex,
            broadcast_hw: broadcast_hw.to_vec(),
            strict_destination,
        };

        let mut prog = filter::reply_filter(xid);
        let fprog = libc::sock_fprog {
            len: prog.len() as u16,
            filter: prog.as_mut_ptr(),
        };
        let ret = unsafe {
            libc::setsockopt(
                sock.fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &fprog as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        // Ask for the checksum-validity flag on every received packet.
        let on: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                sock.fd,
                libc::SOL_PACKET,
                libc::PACKET_AUXDATA,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let addr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: (libc::ETH_P_IP as u16).to_be(),
            sll_ifindex: ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };
        let ret = unsafe {
            libc::bind(
                sock.fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        trace!(ifindex, xid = format_args!("0x{:08x}", xid), "raw socket open");
        Ok(sock)
    }

    /// Broadcast one DHCP payload. `src` is 0.0.0.0 until an address is
    /// held (REBINDING keeps the bound address as source).
    pub fn send(&self, src: Ipv4Addr, payload: &[u8]) -> Result<()> {
        let datagram = build_datagram(src, payload);

        // sockaddr_ll carries 8 address bytes inline; longer link-layer
        // addresses (Infiniband, 20 bytes) extend past the struct and the
        // kernel reads them via the reported sockaddr length.
        let addr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: (libc::ETH_P_IP as u16).to_be(),
            sll_ifindex: self.ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: self.broadcast_hw.len() as u8,
            sll_addr: [0; 8],
        };
        let addr_offset = addr.sll_addr.as_ptr() as usize - &addr as *const _ as usize;
        let mut storage = [0u8; std::mem::size_of::<libc::sockaddr_ll>() + 16];
        unsafe {
            std::ptr::copy_nonoverlapping(
                &addr as *const _ as *const u8,
                storage.as_mut_ptr(),
                std::mem::size_of::<libc::sockaddr_ll>(),
            );
        }
        storage[addr_offset..addr_offset + self.broadcast_hw.len()]
            .copy_from_slice(&self.broadcast_hw);
        let addr_len = std::mem::size_of::<libc::sockaddr_ll>()
            .max(addr_offset + self.broadcast_hw.len());

        let ret = unsafe {
            libc::sendto(
                self.fd,
                datagram.as_ptr() as *const libc::c_void,
                datagram.len(),
                0,
                storage.as_ptr() as *const libc::sockaddr,
                addr_len as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Receive the next admissible DHCP payload, or `None` once the socket
    /// is drained. Packets failing the user-space predicate or the checksum
    /// policy are dropped here.
    pub fn recv(&self, xid: u32) -> Result<Option<Vec<u8>>> {
        let mut buf = [0u8; RECV_BUF_SIZE];

        loop {
            let mut iov = libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            };
            let mut cmsg_buf = [0u8; 64];
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = cmsg_buf.len();

            let n = unsafe { libc::recvmsg(self.fd, &mut msg, 0) };
            if n < 0 {
                let err = io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => Ok(None),
                    _ => Err(Error::Io(err)),
                };
            }

            let datagram = &buf[..n as usize];
            if !filter::matches_reply(datagram, xid) {
                debug!("dropping packet that fails reply predicate");
                continue;
            }
            if self.strict_destination {
                let dst = filter::ip_destination(datagram);
                if dst != Ipv4Addr::BROADCAST && !payload_addressed_to_us(datagram, dst) {
                    debug!(%dst, "dropping reply to foreign destination");
                    continue;
                }
            }
            if !checksum_acceptable(&msg, datagram) {
                debug!("dropping packet with bad UDP checksum");
                continue;
            }

            let ihl = ((datagram[0] & 0x0f) as usize) * 4;
            let udp = &datagram[ihl..];
            let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
            let payload_len = udp_len.saturating_sub(8).min(udp.len() - 8);
            return Ok(Some(udp[8..8 + payload_len].to_vec()));
        }
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Strict destination policy: a unicast reply must target the address the
/// server just handed out (yiaddr of the carried BOOTP payload).
fn payload_addressed_to_us(datagram: &[u8], dst: Ipv4Addr) -> bool {
    let ihl = ((datagram[0] & 0x0f) as usize) * 4;
    let dhcp = &datagram[ihl + 8..];
    dst.octets() == dhcp[16..20]
}

/// Kernel says valid, or we verify ourselves. "Not checked" means user-space
/// verification, not acceptance.
fn checksum_acceptable(msg: &libc::msghdr, datagram: &[u8]) -> bool {
    let mut status: Option<u32> = None;

    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        if hdr.cmsg_level == libc::SOL_PACKET && hdr.cmsg_type == libc::PACKET_AUXDATA {
            let aux = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::tpacket_auxdata) };
            status = Some(aux.tp_status);
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }

    if let Some(st) = status {
        if st & TP_STATUS_CSUM_VALID != 0 {
            return true;
        }
        if st & TP_STATUS_CSUMNOTREADY != 0 {
            // Offloaded or looped packet, checksum never computed: verify.
            return verify_udp(datagram);
        }
    }
    verify_udp(datagram)
}

fn verify_udp(datagram: &[u8]) -> bool {
    let ihl = ((datagram[0] & 0x0f) as usize) * 4;
    let src = [datagram[12], datagram[13], datagram[14], datagram[15]];
    let dst = [datagram[16], datagram[17], datagram[18], datagram[19]];
    let udp = &datagram[ihl..];
    let udp_len = (u16::from_be_bytes([udp[4], udp[5]]) as usize).min(udp.len());
    udp_checksum_ok(src, dst, &udp[..udp_len])
}

/// IP + UDP framing for the broadcast path: 68 -> 67, limited broadcast
/// destination, both checksums filled in.
fn build_datagram(src: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;
    let mut buf = Vec::with_capacity(total_len);

    let dst = Ipv4Addr::BROADCAST;

    // IPv4 header
    buf.push(0x45);
    buf.push(0xc0); // DSCP CS6: network control
    buf.extend_from_slice(&(total_len as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]); // id
    buf.extend_from_slice(&[0, 0]); // flags / fragment offset
    buf.push(64); // ttl
    buf.push(libc::IPPROTO_UDP as u8);
    buf.extend_from_slice(&[0, 0]); // header checksum, below
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
    let sum = ip_checksum(&buf[..20]);
    buf[10..12].copy_from_slice(&sum.to_be_bytes());

    // UDP header
    buf.extend_from_slice(&CLIENT_PORT.to_be_bytes());
    buf.extend_from_slice(&SERVER_PORT.to_be_bytes());
    buf.extend_from_slice(&(udp_len as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]); // checksum, below
    buf.extend_from_slice(payload);
    let sum = udp_checksum(src.octets(), dst.octets(), &buf[20..]);
    buf[26..28].copy_from_slice(&sum.to_be_bytes());

    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::filter::matches_reply;

    #[test]
    fn test_build_datagram_headers() {
        let payload = vec![0xab; 300];
        let buf = build_datagram(Ipv4Addr::UNSPECIFIED, &payload);

        assert_eq!(buf.len(), 20 + 8 + 300);
        assert_eq!(buf[0], 0x45);
        assert_eq!(buf[9], libc::IPPROTO_UDP as u8);
        assert_eq!(&buf[16..20], &[255, 255, 255, 255]);
        assert_eq!(u16::from_be_bytes([buf[20], buf[21]]), CLIENT_PORT);
        assert_eq!(u16::from_be_bytes([buf[22], buf[23]]), SERVER_PORT);

        // Both checksums verify
        assert_eq!(ip_checksum(&buf[..20]), 0);
        assert!(udp_checksum_ok(
            [0, 0, 0, 0],
            [255, 255, 255, 255],
            &buf[20..]
        ));
    }

    #[test]
    fn test_own_datagrams_fail_reply_predicate() {
        // What we send is a request to port 67; the reply filter must not
        // admit our own traffic looped back.
        let mut payload = vec![0u8; 300];
        payload[0] = 1; // BOOTREQUEST
        payload[4..8].copy_from_slice(&7u32.to_be_bytes());
        payload[236..240].copy_from_slice(&crate::proto::MAGIC_COOKIE);
        let buf = build_datagram(Ipv4Addr::UNSPECIFIED, &payload);
        assert!(!matches_reply(&buf, 7));
    }

    #[test]
    fn test_verify_udp_detects_corruption() {
        let mut payload = vec![0u8; 300];
        payload[0] = 2;
        payload[236..240].copy_from_slice(&crate::proto::MAGIC_COOKIE);
        let mut buf = build_datagram(Ipv4Addr::UNSPECIFIED, &payload);
        assert!(verify_udp(&buf));
        buf[40] ^= 0x01;
        assert!(!verify_udp(&buf));
    }
}
