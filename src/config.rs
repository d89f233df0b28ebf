//! Client and probe configuration.
//!
//! Builder-style objects the host fills before handing them over; all
//! validation happens in one place so misconfiguration fails construction,
//! not a later dispatch.

use crate::{Error, Result};
use std::net::Ipv4Addr;

/// Hardware transport of the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Ethernet,
    Infiniband,
}

impl Transport {
    /// ARP hardware type carried in the BOOTP htype field.
    pub fn htype(self) -> u8 {
        match self {
            Transport::Ethernet => 1,
            Transport::Infiniband => 32,
        }
    }

    /// Required hardware address length for config validation.
    pub fn addr_len(self) -> usize {
        match self {
            Transport::Ethernet => 6,
            Transport::Infiniband => 20,
        }
    }
}

/// Identity and policy of one client instance. Fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) ifindex: i32,
    pub(crate) transport: Transport,
    pub(crate) mac: Vec<u8>,
    pub(crate) broadcast_mac: Vec<u8>,
    pub(crate) client_id: Option<Vec<u8>>,
    pub(crate) reply_directly: bool,
    pub(crate) strict_destination: bool,
    pub(crate) mtu: u16,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self {
            ifindex: 0,
            transport: Transport::Ethernet,
            mac: Vec::new(),
            broadcast_mac: Vec::new(),
            client_id: None,
            reply_directly: false,
            strict_destination: false,
            mtu: 1500,
        }
    }

    pub fn set_ifindex(&mut self, ifindex: i32) -> &mut Self {
        self.ifindex = ifindex;
        self
    }

    pub fn set_transport(&mut self, transport: Transport) -> &mut Self {
        self.transport = transport;
        self
    }

    pub fn set_mac(&mut self, mac: &[u8]) -> &mut Self {
        self.mac = mac.to_vec();
        self
    }

    pub fn set_broadcast_mac(&mut self, mac: &[u8]) -> &mut Self {
        self.broadcast_mac = mac.to_vec();
        self
    }

    /// Explicit client identifier (option 61). Without one, a default is
    /// derived from the transport and hardware address.
    pub fn set_client_id(&mut self, id: &[u8]) -> &mut Self {
        self.client_id = Some(id.to_vec());
        self
    }

    /// The server may unicast replies to our hardware address before the
    /// stack is configured. Clears the BROADCAST flag on Ethernet;
    /// Infiniband ignores this and always requests broadcasts.
    pub fn set_reply_directly(&mut self, on: bool) -> &mut Self {
        self.reply_directly = on;
        self
    }

    /// Require the IP destination of raw-path replies to be the limited
    /// broadcast or the address being handed out. Default is the permissive
    /// client-port-only match.
    pub fn set_strict_destination(&mut self, on: bool) -> &mut Self {
        self.strict_destination = on;
        self
    }

    pub fn set_mtu(&mut self, mtu: u16) -> &mut Self {
        self.mtu = mtu;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ifindex <= 0 {
            return Err(Error::Config(format!("bad ifindex {}", self.ifindex)));
        }
        let want = self.transport.addr_len();
        if self.mac.len() != want {
            return Err(Error::Config(format!(
                "hardware address is {} bytes, transport requires {}",
                self.mac.len(),
                want
            )));
        }
        if self.broadcast_mac.len() != want {
            return Err(Error::Config(format!(
                "broadcast address is {} bytes, transport requires {}",
                self.broadcast_mac.len(),
                want
            )));
        }
        Ok(())
    }

    /// BROADCAST flag policy: Infiniband always, Ethernet unless the caller
    /// asked for direct replies.
    pub(crate) fn request_broadcast(&self) -> bool {
        match self.transport {
            Transport::Infiniband => true,
            Transport::Ethernet => !self.reply_directly,
        }
    }

    /// chaddr bytes for outbound messages. Infiniband addresses do not fit
    /// chaddr; RFC 4390 mandates hlen 0 there.
    pub(crate) fn chaddr(&self) -> &[u8] {
        match self.transport {
            Transport::Ethernet => &self.mac,
            Transport::Infiniband => &[],
        }
    }

    /// Effective client identifier: the configured one, or type + hardware
    /// address (for Infiniband the low 8 bytes of the GID, per RFC 4390).
    pub(crate) fn effective_client_id(&self) -> Vec<u8> {
        if let Some(id) = &self.client_id {
            return id.clone();
        }
        let mut id = vec![self.transport.htype()];
        match self.transport {
            Transport::Ethernet => id.extend_from_slice(&self.mac),
            Transport::Infiniband => id.extend_from_slice(&self.mac[self.mac.len() - 8..]),
        }
        id
    }

    /// Largest DHCP payload the send path may produce.
    pub(crate) fn max_message_size(&self) -> usize {
        (self.mtu as usize)
            .saturating_sub(20 + 8)
            .max(crate::proto::MIN_MAX_MESSAGE_SIZE)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-acquisition settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub(crate) requested_ip: Option<Ipv4Addr>,
    pub(crate) init_reboot: bool,
    pub(crate) inform_only: bool,
    pub(crate) accept_first_offer: bool,
    pub(crate) allow_link_local: bool,
    pub(crate) requested_params: Vec<u8>,
}

impl ProbeConfig {
    pub fn new() -> Self {
        use crate::proto::opt;
        Self {
            requested_ip: None,
            init_reboot: false,
            inform_only: false,
            accept_first_offer: false,
            allow_link_local: false,
            requested_params: vec![
                opt::SUBNET_MASK,
                opt::ROUTER,
                opt::DNS_SERVER,
                opt::DOMAIN_NAME,
                opt::LEASE_TIME,
                opt::RENEWAL_TIME,
                opt::REBINDING_TIME,
            ],
        }
    }

    /// Ask for a specific address (option 50 on the first REQUEST or
    /// DISCOVER).
    pub fn set_requested_ip(&mut self, ip: Ipv4Addr) -> &mut Self {
        self.requested_ip = Some(ip);
        self
    }

    /// Start with an INIT-REBOOT REQUEST for the previously held address
    /// instead of a DISCOVER. Requires `set_requested_ip`.
    pub fn set_init_reboot(&mut self, on: bool) -> &mut Self {
        self.init_reboot = on;
        self
    }

    /// Only query configuration via DHCPINFORM; the address is managed
    /// elsewhere. Requires `set_requested_ip` with the address in use.
    pub fn set_inform_only(&mut self, on: bool) -> &mut Self {
        self.inform_only = on;
        self
    }

    /// Take the first well-formed OFFER instead of collecting offers for a
    /// selection window and waiting for an explicit `select()`.
    pub fn set_accept_first_offer(&mut self, on: bool) -> &mut Self {
        self.accept_first_offer = on;
        self
    }

    /// Tolerate servers assigning 169.254/16 addresses.
    pub fn set_allow_link_local(&mut self, on: bool) -> &mut Self {
        self.allow_link_local = on;
        self
    }

    /// Parameter request list (option 55) for outbound requests.
    pub fn set_requested_params(&mut self, codes: &[u8]) -> &mut Self {
        self.requested_params = codes.to_vec();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.init_reboot && self.requested_ip.is_none() {
            return Err(Error::Config(
                "init-reboot needs the previously held address".into(),
            ));
        }
        if self.inform_only && self.requested_ip.is_none() {
            return Err(Error::Config(
                "inform-only needs the address in use".into(),
            ));
        }
        if self.inform_only && self.init_reboot {
            return Err(Error::Config(
                "inform-only and init-reboot are mutually exclusive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth_config() -> ClientConfig {
        let mut c = ClientConfig::new();
        c.set_ifindex(2)
            .set_mac(&[0x02, 0, 0, 0, 0, 0x01])
            .set_broadcast_mac(&[0xff; 6]);
        c
    }

    #[test]
    fn test_valid_ethernet_config() {
        assert!(eth_config().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_ifindex() {
        let mut c = eth_config();
        c.set_ifindex(0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_rejects_wrong_mac_len() {
        let mut c = eth_config();
        c.set_mac(&[1, 2, 3]);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_infiniband_needs_20_bytes() {
        let mut c = ClientConfig::new();
        c.set_ifindex(3)
            .set_transport(Transport::Infiniband)
            .set_mac(&[0u8; 6])
            .set_broadcast_mac(&[0u8; 6]);
        assert!(c.validate().is_err());

        c.set_mac(&[0u8; 20]).set_broadcast_mac(&[0u8; 20]);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_broadcast_flag_policy() {
        let mut c = eth_config();
        assert!(c.request_broadcast());
        c.set_reply_directly(true);
        assert!(!c.request_broadcast());

        let mut ib = ClientConfig::new();
        ib.set_ifindex(3)
            .set_transport(Transport::Infiniband)
            .set_mac(&[0u8; 20])
            .set_broadcast_mac(&[0u8; 20])
            .set_reply_directly(true);
        assert!(ib.request_broadcast());
    }

    #[test]
    fn test_default_client_id() {
        let c = eth_config();
        assert_eq!(c.effective_client_id(), vec![1, 0x02, 0, 0, 0, 0, 0x01]);

        let mut ib = ClientConfig::new();
        let mut gid = vec![0u8; 20];
        gid[12..].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        ib.set_transport(Transport::Infiniband).set_mac(&gid);
        let id = ib.effective_client_id();
        assert_eq!(id[0], 32);
        assert_eq!(&id[1..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_infiniband_chaddr_empty() {
        let mut ib = ClientConfig::new();
        ib.set_transport(Transport::Infiniband).set_mac(&[0u8; 20]);
        assert!(ib.chaddr().is_empty());
    }

    #[test]
    fn test_max_message_size_floor() {
        let mut c = eth_config();
        assert_eq!(c.max_message_size(), 1500 - 28);
        c.set_mtu(300);
        assert_eq!(c.max_message_size(), crate::proto::MIN_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_probe_config_validation() {
        let mut p = ProbeConfig::new();
        p.set_init_reboot(true);
        assert!(p.validate().is_err());
        p.set_requested_ip(Ipv4Addr::new(10, 0, 0, 42));
        assert!(p.validate().is_ok());
    }
}
