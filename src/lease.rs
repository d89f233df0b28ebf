//! Leases: immutable snapshots of a server-offered configuration.
//!
//! A [`Lease`] is created from an OFFER or an ACK, shared as `Arc<Lease>`
//! between the probe and any external holders, and never mutated. Lifetime
//! timers (T1, T2, expiry) are fixed at construction from a monotonic
//! acquisition timestamp.

use crate::proto::{opt, Message, RawOption};
use crate::{Error, Result};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::warn;

/// Ceiling for nonsensical lease times (0 or beyond 2^31 seconds): one week.
pub const MAX_LIFETIME_SECS: u64 = 7 * 24 * 3600;

/// An IPv4 configuration granted (or offered) by one DHCP server.
#[derive(Debug, Clone)]
pub struct Lease {
    address: Ipv4Addr,
    server_id: Ipv4Addr,
    lifetime: Duration,
    t1: Duration,
    t2: Duration,
    acquired_at: Instant,
    options: Vec<RawOption>,
}

impl Lease {
    /// Build from a well-formed OFFER. Offers need a server identifier and
    /// a usable address; lifetime handling waits for the ACK.
    pub fn from_offer(msg: &Message, now: Instant) -> Result<Self> {
        let server_id = msg
            .server_id()
            .ok_or_else(|| Error::Parse("offer missing server identifier".into()))?;
        if msg.yiaddr.is_unspecified() {
            return Err(Error::Parse("offer carries no address".into()));
        }
        Ok(Self::build(msg, server_id, now))
    }

    /// Build from an ACK. An ACK missing the server identifier or the lease
    /// time is malformed and must be ignored by the caller, not NAKed.
    pub fn from_ack(msg: &Message, now: Instant, allow_link_local: bool) -> Result<Self> {
        let server_id = msg
            .server_id()
            .ok_or_else(|| Error::Parse("ack missing server identifier".into()))?;
        if msg.lease_time().is_none() {
            return Err(Error::Parse("ack missing lease time".into()));
        }
        check_address_sane(msg, allow_link_local)?;
        Ok(Self::build(msg, server_id, now))
    }

    /// Build from the ACK to a DHCPINFORM: configuration only, no address
    /// of our own and no lifetime timers.
    pub fn from_inform_ack(msg: &Message, now: Instant) -> Result<Self> {
        let server_id = msg
            .server_id()
            .ok_or_else(|| Error::Parse("ack missing server identifier".into()))?;
        Ok(Self::build(msg, server_id, now))
    }

    fn build(msg: &Message, server_id: Ipv4Addr, now: Instant) -> Self {
        let lifetime = clamp_lifetime(msg.lease_time());
        let t1 = msg
            .option_u32(opt::RENEWAL_TIME)
            .map(u64::from)
            .unwrap_or(lifetime / 2);
        let t2 = msg
            .option_u32(opt::REBINDING_TIME)
            .map(u64::from)
            .unwrap_or(lifetime * 7 / 8);

        // 0 < T1 <= T2 <= lifetime
        let t2 = t2.clamp(1, lifetime.max(1));
        let t1 = t1.clamp(1, t2);

        Self {
            address: msg.yiaddr,
            server_id,
            lifetime: Duration::from_secs(lifetime),
            t1: Duration::from_secs(t1),
            t2: Duration::from_secs(t2),
            acquired_at: now,
            options: msg.options().to_vec(),
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn server_id(&self) -> Ipv4Addr {
        self.server_id
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn t1(&self) -> Duration {
        self.t1
    }

    pub fn t2(&self) -> Duration {
        self.t2
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn renewal_deadline(&self) -> Instant {
        self.acquired_at + self.t1
    }

    pub fn rebind_deadline(&self) -> Instant {
        self.acquired_at + self.t2
    }

    pub fn expiry_deadline(&self) -> Instant {
        self.acquired_at + self.lifetime
    }

    /// Raw option payload by code, unknown codes included.
    pub fn query(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|o| o.code == code)
            .map(|o| o.data.as_slice())
    }

    pub fn query_u32(&self, code: u8) -> Option<u32> {
        self.query(code).and_then(|d| {
            d.get(..4)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        })
    }

    pub fn query_ip(&self, code: u8) -> Option<Ipv4Addr> {
        self.query(code)
            .and_then(|d| d.get(..4).map(|b| Ipv4Addr::new(b[0], b[1], b[2], b[3])))
    }

    pub fn query_ip_list(&self, code: u8) -> Option<Vec<Ipv4Addr>> {
        self.query(code).map(|d| {
            d.chunks_exact(4)
                .map(|b| Ipv4Addr::new(b[0], b[1], b[2], b[3]))
                .collect()
        })
    }

    pub fn query_str(&self, code: u8) -> Option<&str> {
        self.query(code)
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\0'))
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.query_ip(opt::SUBNET_MASK)
    }

    pub fn prefix_len(&self) -> Option<u8> {
        self.subnet_mask()
            .map(|m| u32::from(m).count_ones() as u8)
    }

    pub fn routers(&self) -> Vec<Ipv4Addr> {
        self.query_ip_list(opt::ROUTER).unwrap_or_default()
    }

    pub fn dns_servers(&self) -> Vec<Ipv4Addr> {
        self.query_ip_list(opt::DNS_SERVER).unwrap_or_default()
    }

    pub fn domain_name(&self) -> Option<&str> {
        self.query_str(opt::DOMAIN_NAME)
    }
}

fn clamp_lifetime(raw: Option<u32>) -> u64 {
    match raw {
        Some(secs) if secs != 0 && u64::from(secs) <= (1 << 31) => u64::from(secs),
        Some(secs) => {
            warn!(secs, "nonsensical lease time clamped to one week");
            MAX_LIFETIME_SECS
        }
        None => MAX_LIFETIME_SECS,
    }
}

/// Address sanity for an ACK: reject the unspecified address, the limited
/// broadcast, the subnet broadcast when a mask is present, and link-local
/// addresses unless the caller opted in.
fn check_address_sane(msg: &Message, allow_link_local: bool) -> Result<()> {
    let addr = msg.yiaddr;
    if addr.is_unspecified() {
        return Err(Error::Parse("ack assigns 0.0.0.0".into()));
    }
    if addr == Ipv4Addr::BROADCAST {
        return Err(Error::Parse("ack assigns the limited broadcast".into()));
    }
    if let Some(mask) = msg.subnet_mask() {
        let bcast = u32::from(addr) | !u32::from(mask);
        if u32::from(addr) == bcast && u32::from(mask) != u32::MAX {
            return Err(Error::Parse("ack assigns the subnet broadcast".into()));
        }
    }
    if !allow_link_local && addr.is_link_local() {
        return Err(Error::Parse("ack assigns a link-local address".into()));
    }
    Ok(())
}
