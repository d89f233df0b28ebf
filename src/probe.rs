//! The acquisition state machine.
//!
//! Implements the RFC 2131 client lifecycle: INIT -> SELECTING ->
//! REQUESTING -> BOUND -> RENEWING -> REBINDING, with the INIT-REBOOT and
//! INFORM variants. [`Machine`] is a pure reducer over
//! `(state, input, now)`: it owns no sockets and reads no clock, returning
//! [`Effect`]s the runtime applies. That keeps every transition, timer and
//! retransmission decision testable with synthetic timestamps.

use crate::config::{ClientConfig, ProbeConfig, Transport};
use crate::event::Event;
use crate::lease::Lease;
use crate::proto::{BootpOp, Message, MessageBuilder, MessageType};
use crate::{Error, Result};
use rand::Rng;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// First retransmission delay (RFC 2131 §4.1)
const INITIAL_DELAY: Duration = Duration::from_secs(4);

/// Retransmission delay ceiling
const MAX_DELAY: Duration = Duration::from_secs(64);

/// Each delay is randomized by +-1s
const JITTER_SPAN_MILLIS: u64 = 2000;

/// Unanswered REQUESTs before REQUESTING gives up and retracts
const REQUESTING_MAX_ATTEMPTS: u32 = 5;

/// Unanswered INIT-REBOOT REQUESTs before falling back to DISCOVER
const REBOOT_FALLBACK_ATTEMPTS: u32 = 2;

/// Offer collection window, measured from the first OFFER
const SELECTION_WINDOW: Duration = Duration::from_secs(3);

/// Floor for RENEWING/REBINDING retransmit intervals
const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Selecting,
    Rebooting,
    Requesting,
    /// ACK received; waiting for the host to `accept()` or `decline()`.
    Granted,
    Bound,
    Renewing,
    Rebinding,
    Expired,
    Cancelled,
}

impl State {
    /// A live probe blocks creation of another one on the same client.
    pub fn is_live(self) -> bool {
        !matches!(self, State::Init | State::Expired | State::Cancelled)
    }
}

/// Side effects requested by a transition. The runtime owns the sockets and
/// the event queue; the machine only decides.
#[derive(Debug)]
pub(crate) enum Effect {
    OpenRaw { xid: u32 },
    CloseRaw,
    OpenUdp { local: Ipv4Addr, server: Ipv4Addr },
    CloseUdp,
    /// Send on the raw path with the given IP source.
    Broadcast { msg: Message, src: Ipv4Addr },
    /// Send on the bound UDP path.
    Unicast(Message),
    Notify(Event),
}

pub(crate) struct Machine {
    client: ClientConfig,
    config: ProbeConfig,
    state: State,
    xid: u32,
    started_at: Option<Instant>,
    // Retransmission: current pre-jitter delay, transmissions so far
    attempt: u32,
    delay: Duration,
    retransmit_at: Option<Instant>,
    // SELECTING
    offers: Vec<Arc<Lease>>,
    select_by: Option<Instant>,
    selected: Option<Arc<Lease>>,
    // Lease lifecycle
    lease: Option<Arc<Lease>>,
    t1_at: Option<Instant>,
    t2_at: Option<Instant>,
    expire_at: Option<Instant>,
}

impl Machine {
    pub fn new(client: ClientConfig, config: ProbeConfig) -> Self {
        Self {
            client,
            config,
            state: State::Init,
            xid: random_xid(),
            started_at: None,
            attempt: 0,
            delay: INITIAL_DELAY,
            retransmit_at: None,
            offers: Vec::new(),
            select_by: None,
            selected: None,
            lease: None,
            t1_at: None,
            t2_at: None,
            expire_at: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn lease(&self) -> Option<&Arc<Lease>> {
        self.lease.as_ref()
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.client.set_mtu(mtu);
    }

    pub fn max_message_size(&self) -> usize {
        self.client.max_message_size()
    }

    /// Begin acquisition. INIT -> SELECTING (DISCOVER), INIT -> REBOOTING
    /// (INIT-REBOOT REQUEST), or the INFORM variant.
    pub fn start(&mut self, now: Instant) -> Vec<Effect> {
        self.started_at = Some(now);
        self.attempt = 1;
        self.delay = INITIAL_DELAY;
        self.retransmit_at = Some(now + jittered(INITIAL_DELAY));

        let mut effects = vec![Effect::OpenRaw { xid: self.xid }];

        if self.config.inform_only {
            info!(xid = format_args!("0x{:08x}", self.xid), "starting inform probe");
            self.state = State::Requesting;
            effects.push(self.broadcast(self.build_inform(now)));
        } else if self.config.init_reboot {
            info!(
                xid = format_args!("0x{:08x}", self.xid),
                ip = ?self.config.requested_ip,
                "starting init-reboot probe"
            );
            self.state = State::Rebooting;
            effects.push(self.broadcast(self.build_reboot_request(now)));
        } else {
            info!(xid = format_args!("0x{:08x}", self.xid), "starting probe");
            self.state = State::Selecting;
            effects.push(self.broadcast(self.build_discover(now)));
        }
        effects
    }

    /// Feed one validated inbound message. Within a dispatch, inbound
    /// traffic is handled before timers so a reply racing its retransmit
    /// deadline wins.
    pub fn handle_message(&mut self, msg: &Message, now: Instant) -> Vec<Effect> {
        if msg.xid != self.xid {
            debug!(
                got = format_args!("0x{:08x}", msg.xid),
                want = format_args!("0x{:08x}", self.xid),
                "ignoring reply with foreign xid"
            );
            return Vec::new();
        }
        if self.client.transport == Transport::Ethernet
            && msg.hlen == 6
            && msg.chaddr[..6] != self.client.chaddr()[..6]
        {
            debug!("ignoring reply for another hardware address");
            return Vec::new();
        }

        let Some(msg_type) = msg.message_type() else {
            debug!("ignoring reply without message type");
            return Vec::new();
        };

        debug!(?msg_type, state = ?self.state, "reply received");

        match (self.state, msg_type) {
            (State::Selecting, MessageType::Offer) => self.on_offer(msg, now),
            (State::Requesting, MessageType::Ack) | (State::Rebooting, MessageType::Ack) => {
                self.on_ack(msg, now)
            }
            (State::Requesting, MessageType::Nak) | (State::Rebooting, MessageType::Nak) => {
                self.on_nak(msg)
            }
            (State::Renewing, MessageType::Ack) | (State::Rebinding, MessageType::Ack) => {
                self.on_extend_ack(msg, now)
            }
            (State::Renewing, MessageType::Nak) | (State::Rebinding, MessageType::Nak) => {
                self.on_nak(msg)
            }
            _ => {
                debug!(?msg_type, state = ?self.state, "reply ignored in this state");
                Vec::new()
            }
        }
    }

    fn on_offer(&mut self, msg: &Message, now: Instant) -> Vec<Effect> {
        let lease = match Lease::from_offer(msg, now) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                debug!(error = %e, "dropping malformed offer");
                return Vec::new();
            }
        };

        if self
            .offers
            .iter()
            .any(|o| o.server_id() == lease.server_id() && o.address() == lease.address())
        {
            debug!(server = %lease.server_id(), "duplicate offer");
            return Vec::new();
        }

        info!(
            address = %lease.address(),
            server = %lease.server_id(),
            "offer received"
        );

        if self.config.accept_first_offer {
            self.offers.push(lease.clone());
            return self.request_offer(lease, now);
        }

        if self.offers.is_empty() {
            self.select_by = Some(now + SELECTION_WINDOW);
        }
        self.offers.push(lease.clone());
        vec![Effect::Notify(Event::Offer(lease))]
    }

    /// Host-driven (or policy-driven) promotion of an offer:
    /// SELECTING -> REQUESTING.
    pub fn select(&mut self, lease: &Arc<Lease>, now: Instant) -> Result<Vec<Effect>> {
        if self.state != State::Selecting {
            return Err(Error::InvalidState(format!(
                "select in {:?}",
                self.state
            )));
        }
        let chosen = self
            .offers
            .iter()
            .find(|o| {
                Arc::ptr_eq(o, lease)
                    || (o.server_id() == lease.server_id() && o.address() == lease.address())
            })
            .cloned()
            .ok_or_else(|| Error::InvalidState("lease was not offered to this probe".into()))?;
        Ok(self.request_offer(chosen, now))
    }

    fn request_offer(&mut self, lease: Arc<Lease>, now: Instant) -> Vec<Effect> {
        self.state = State::Requesting;
        self.selected = Some(lease);
        self.select_by = None;
        self.attempt = 1;
        self.delay = INITIAL_DELAY;
        self.retransmit_at = Some(now + jittered(INITIAL_DELAY));
        vec![self.broadcast(self.build_select_request(now))]
    }

    fn on_ack(&mut self, msg: &Message, now: Instant) -> Vec<Effect> {
        let lease = if self.config.inform_only {
            Lease::from_inform_ack(msg, now)
        } else {
            Lease::from_ack(msg, now, self.config.allow_link_local)
        };
        let lease = match lease {
            Ok(l) => Arc::new(l),
            Err(e) => {
                debug!(error = %e, "ignoring malformed ack");
                return Vec::new();
            }
        };

        info!(
            address = %lease.address(),
            server = %lease.server_id(),
            lifetime = lease.lifetime().as_secs(),
            "lease granted"
        );

        self.state = State::Granted;
        self.retransmit_at = None;
        if !self.config.inform_only {
            self.expire_at = Some(lease.expiry_deadline());
        }
        self.lease = Some(lease.clone());
        vec![Effect::Notify(Event::Granted(lease))]
    }

    fn on_extend_ack(&mut self, msg: &Message, now: Instant) -> Vec<Effect> {
        let lease = match Lease::from_ack(msg, now, self.config.allow_link_local) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                debug!(error = %e, "ignoring malformed ack");
                return Vec::new();
            }
        };

        info!(
            address = %lease.address(),
            server = %lease.server_id(),
            lifetime = lease.lifetime().as_secs(),
            "lease extended"
        );

        let was_rebinding = self.state == State::Rebinding;
        let old = self.lease.take();

        self.state = State::Bound;
        self.retransmit_at = None;
        self.t1_at = Some(lease.renewal_deadline());
        self.t2_at = Some(lease.rebind_deadline());
        self.expire_at = Some(lease.expiry_deadline());
        self.lease = Some(lease.clone());

        let mut effects = Vec::new();
        if was_rebinding {
            effects.push(Effect::CloseRaw);
            effects.push(Effect::OpenUdp {
                local: lease.address(),
                server: lease.server_id(),
            });
        } else if old.as_ref().is_some_and(|o| {
            o.server_id() != lease.server_id() || o.address() != lease.address()
        }) {
            effects.push(Effect::CloseUdp);
            effects.push(Effect::OpenUdp {
                local: lease.address(),
                server: lease.server_id(),
            });
        }
        effects.push(Effect::Notify(Event::Extended(lease)));
        effects
    }

    fn on_nak(&mut self, msg: &Message) -> Vec<Effect> {
        let reason = msg.option_str(crate::proto::opt::MESSAGE).unwrap_or("");
        warn!(reason, "server retracted the lease");

        self.state = State::Init;
        self.clear_lease_state();
        vec![
            Effect::CloseRaw,
            Effect::CloseUdp,
            Effect::Notify(Event::Retracted),
        ]
    }

    /// Confirm a granted lease: GRANTED -> BOUND. Opens the unicast path
    /// and arms T1/T2 (the expiry timer has been running since the ACK).
    pub fn accept(&mut self, _now: Instant) -> Result<Vec<Effect>> {
        if self.state != State::Granted {
            return Err(Error::InvalidState(format!("accept in {:?}", self.state)));
        }
        let lease = self.lease.clone().expect("granted without lease");

        self.state = State::Bound;
        if self.config.inform_only {
            // Configuration-only: nothing to renew, nothing to expire.
            self.expire_at = None;
            return Ok(vec![Effect::CloseRaw]);
        }

        self.t1_at = Some(lease.renewal_deadline());
        self.t2_at = Some(lease.rebind_deadline());
        Ok(vec![
            Effect::CloseRaw,
            Effect::OpenUdp {
                local: lease.address(),
                server: lease.server_id(),
            },
        ])
    }

    /// Refuse a granted lease (address already in use): broadcast a
    /// DHCPDECLINE and fall back to INIT.
    pub fn decline(&mut self, reason: &str, now: Instant) -> Result<Vec<Effect>> {
        if self.state != State::Granted {
            return Err(Error::InvalidState(format!("decline in {:?}", self.state)));
        }
        let lease = self.lease.clone().expect("granted without lease");

        info!(address = %lease.address(), "declining lease");
        let msg = self.build_decline(&lease, reason, now);

        self.state = State::Init;
        self.clear_lease_state();
        Ok(vec![self.broadcast(msg), Effect::CloseRaw])
    }

    /// Hand the address back: BOUND -> CANCELLED via DHCPRELEASE.
    pub fn release(&mut self, now: Instant) -> Result<Vec<Effect>> {
        if self.state != State::Bound || self.config.inform_only {
            return Err(Error::InvalidState(format!("release in {:?}", self.state)));
        }
        let lease = self.lease.clone().expect("bound without lease");

        info!(address = %lease.address(), "releasing lease");
        let msg = self.build_release(&lease, now);

        self.state = State::Cancelled;
        self.clear_lease_state();
        Ok(vec![
            Effect::Unicast(msg),
            Effect::CloseUdp,
            Effect::Notify(Event::Cancelled),
        ])
    }

    /// Host cancellation; also used when the probe handle is dropped.
    pub fn cancel(&mut self) -> Vec<Effect> {
        if matches!(self.state, State::Cancelled | State::Expired) {
            return Vec::new();
        }
        info!(state = ?self.state, "probe cancelled");
        self.state = State::Cancelled;
        self.clear_lease_state();
        vec![
            Effect::CloseRaw,
            Effect::CloseUdp,
            Effect::Notify(Event::Cancelled),
        ]
    }

    fn clear_lease_state(&mut self) {
        self.retransmit_at = None;
        self.select_by = None;
        self.offers.clear();
        self.selected = None;
        self.lease = None;
        self.t1_at = None;
        self.t2_at = None;
        self.expire_at = None;
    }

    /// The next instant at which [`Machine::handle_timeout`] has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadlines: Vec<Instant> = Vec::new();
        match self.state {
            State::Selecting => {
                deadlines.extend(self.retransmit_at);
                deadlines.extend(self.select_by);
            }
            State::Rebooting | State::Requesting => {
                deadlines.extend(self.retransmit_at);
            }
            State::Granted => {
                deadlines.extend(self.expire_at);
            }
            State::Bound => {
                deadlines.extend(self.t1_at);
                deadlines.extend(self.expire_at);
            }
            State::Renewing => {
                deadlines.extend(self.retransmit_at);
                deadlines.extend(self.t2_at);
                deadlines.extend(self.expire_at);
            }
            State::Rebinding => {
                deadlines.extend(self.retransmit_at);
                deadlines.extend(self.expire_at);
            }
            State::Init | State::Expired | State::Cancelled => {}
        }
        deadlines.into_iter().min()
    }

    /// Fire every deadline at or before `now`.
    pub fn handle_timeout(&mut self, now: Instant) -> Vec<Effect> {
        // Expiry outranks every other timer in the leased states.
        if matches!(
            self.state,
            State::Granted | State::Bound | State::Renewing | State::Rebinding
        ) && self.expire_at.is_some_and(|t| t <= now)
        {
            return self.on_expired();
        }

        match self.state {
            State::Selecting => {
                if self.select_by.is_some_and(|t| t <= now) {
                    // Window closed without an explicit select(): take the
                    // first buffered offer.
                    let first = self.offers.first().cloned();
                    if let Some(lease) = first {
                        info!(server = %lease.server_id(), "selection window closed, taking first offer");
                        return self.request_offer(lease, now);
                    }
                    self.select_by = None;
                }
                if self.retransmit_due(now) {
                    self.back_off();
                    self.retransmit_at = Some(now + jittered(self.delay));
                    debug!(attempt = self.attempt, "retransmitting discover");
                    return vec![self.broadcast(self.build_discover(now))];
                }
                Vec::new()
            }

            State::Rebooting => {
                if self.retransmit_due(now) {
                    if self.attempt >= REBOOT_FALLBACK_ATTEMPTS {
                        info!("no answer to init-reboot, falling back to discovery");
                        self.state = State::Selecting;
                        self.attempt = 1;
                        self.delay = INITIAL_DELAY;
                        self.retransmit_at = Some(now + jittered(INITIAL_DELAY));
                        return vec![self.broadcast(self.build_discover(now))];
                    }
                    self.back_off();
                    self.retransmit_at = Some(now + jittered(self.delay));
                    return vec![self.broadcast(self.build_reboot_request(now))];
                }
                Vec::new()
            }

            State::Requesting => {
                if self.retransmit_due(now) {
                    if self.attempt >= REQUESTING_MAX_ATTEMPTS {
                        warn!("request went unanswered, retracting");
                        self.state = State::Init;
                        self.clear_lease_state();
                        return vec![
                            Effect::CloseRaw,
                            Effect::Notify(Event::Retracted),
                        ];
                    }
                    self.back_off();
                    self.retransmit_at = Some(now + jittered(self.delay));
                    let msg = if self.config.inform_only {
                        self.build_inform(now)
                    } else {
                        self.build_select_request(now)
                    };
                    return vec![self.broadcast(msg)];
                }
                Vec::new()
            }

            State::Bound => {
                if self.t1_at.is_some_and(|t| t <= now) {
                    let lease = self.lease.clone().expect("bound without lease");
                    info!(server = %lease.server_id(), "T1 elapsed, renewing");
                    self.state = State::Renewing;
                    self.t1_at = None;
                    self.retransmit_at = Some(now + self.renew_interval(now));
                    return vec![Effect::Unicast(self.build_refresh_request(&lease, now))];
                }
                Vec::new()
            }

            State::Renewing => {
                if self.t2_at.is_some_and(|t| t <= now) {
                    let lease = self.lease.clone().expect("renewing without lease");
                    warn!("T2 elapsed without an ack, rebinding");
                    self.state = State::Rebinding;
                    self.t2_at = None;
                    self.retransmit_at = Some(now + self.rebind_interval(now));
                    return vec![
                        Effect::CloseUdp,
                        Effect::OpenRaw { xid: self.xid },
                        Effect::Broadcast {
                            msg: self.build_refresh_request(&lease, now),
                            src: lease.address(),
                        },
                    ];
                }
                if self.retransmit_due(now) {
                    let lease = self.lease.clone().expect("renewing without lease");
                    self.retransmit_at = Some(now + self.renew_interval(now));
                    return vec![Effect::Unicast(self.build_refresh_request(&lease, now))];
                }
                Vec::new()
            }

            State::Rebinding => {
                if self.retransmit_due(now) {
                    let lease = self.lease.clone().expect("rebinding without lease");
                    self.retransmit_at = Some(now + self.rebind_interval(now));
                    return vec![Effect::Broadcast {
                        msg: self.build_refresh_request(&lease, now),
                        src: lease.address(),
                    }];
                }
                Vec::new()
            }

            State::Init | State::Granted | State::Expired | State::Cancelled => Vec::new(),
        }
    }

    fn on_expired(&mut self) -> Vec<Effect> {
        warn!("lease expired");
        self.state = State::Expired;
        self.clear_lease_state();
        vec![
            Effect::CloseRaw,
            Effect::CloseUdp,
            Effect::Notify(Event::Expired),
        ]
    }

    fn retransmit_due(&self, now: Instant) -> bool {
        self.retransmit_at.is_some_and(|t| t <= now)
    }

    fn back_off(&mut self) {
        self.attempt += 1;
        self.delay = (self.delay * 2).min(MAX_DELAY);
    }

    /// RENEWING retries at half the remaining time to T2, floored.
    fn renew_interval(&self, now: Instant) -> Duration {
        let remaining = self
            .t2_at
            .map(|t| t.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        (remaining / 2).max(MIN_RETRY_INTERVAL)
    }

    /// REBINDING retries at half the remaining time to expiry, floored.
    fn rebind_interval(&self, now: Instant) -> Duration {
        let remaining = self
            .expire_at
            .map(|t| t.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        (remaining / 2).max(MIN_RETRY_INTERVAL)
    }

    fn secs(&self, now: Instant) -> u16 {
        self.started_at
            .map(|t| now.duration_since(t).as_secs().min(u64::from(u16::MAX)) as u16)
            .unwrap_or(0)
    }

    fn base(&self, msg_type: MessageType, now: Instant) -> MessageBuilder {
        MessageBuilder::new(BootpOp::Request)
            .xid(self.xid)
            .secs(self.secs(now))
            .broadcast(self.client.request_broadcast())
            .hardware(self.client.transport.htype(), self.client.chaddr())
            .message_type(msg_type)
            .client_id(&self.client.effective_client_id())
            .max_message_size(self.client.max_message_size() as u16)
    }

    fn build_discover(&self, now: Instant) -> Message {
        let mut b = self
            .base(MessageType::Discover, now)
            .parameter_request_list(&self.config.requested_params);
        if let Some(ip) = self.config.requested_ip {
            b = b.requested_ip(ip);
        }
        b.build()
    }

    fn build_select_request(&self, now: Instant) -> Message {
        let lease = self.selected.as_ref().expect("requesting without offer");
        self.base(MessageType::Request, now)
            .requested_ip(lease.address())
            .server_id(lease.server_id())
            .parameter_request_list(&self.config.requested_params)
            .build()
    }

    fn build_reboot_request(&self, now: Instant) -> Message {
        let ip = self.config.requested_ip.expect("init-reboot without address");
        self.base(MessageType::Request, now)
            .requested_ip(ip)
            .parameter_request_list(&self.config.requested_params)
            .build()
    }

    /// RENEWING/REBINDING REQUEST: ciaddr filled, no option 50/54.
    fn build_refresh_request(&self, lease: &Lease, now: Instant) -> Message {
        self.base(MessageType::Request, now)
            .ciaddr(lease.address())
            .parameter_request_list(&self.config.requested_params)
            .build()
    }

    fn build_inform(&self, now: Instant) -> Message {
        let ip = self.config.requested_ip.expect("inform without address");
        self.base(MessageType::Inform, now)
            .ciaddr(ip)
            .parameter_request_list(&self.config.requested_params)
            .build()
    }

    fn build_decline(&self, lease: &Lease, reason: &str, now: Instant) -> Message {
        self.base(MessageType::Decline, now)
            .requested_ip(lease.address())
            .server_id(lease.server_id())
            .message(reason)
            .build()
    }

    fn build_release(&self, lease: &Lease, now: Instant) -> Message {
        self.base(MessageType::Release, now)
            .ciaddr(lease.address())
            .server_id(lease.server_id())
            .build()
    }

    fn broadcast(&self, msg: Message) -> Effect {
        Effect::Broadcast {
            msg,
            src: Ipv4Addr::UNSPECIFIED,
        }
    }
}

fn random_xid() -> u32 {
    loop {
        let xid: u32 = rand::thread_rng().gen();
        if xid != 0 {
            return xid;
        }
    }
}

/// `delay` +- 1s, uniformly.
fn jittered(delay: Duration) -> Duration {
    let offset = rand::thread_rng().gen_range(0..=JITTER_SPAN_MILLIS);
    (delay + Duration::from_millis(offset)).saturating_sub(Duration::from_millis(
        JITTER_SPAN_MILLIS / 2,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::opt;

    fn client_config() -> ClientConfig {
        let mut c = ClientConfig::new();
        c.set_ifindex(2)
            .set_mac(&[0x02, 0, 0, 0, 0, 0x01])
            .set_broadcast_mac(&[0xff; 6]);
        c
    }

    fn machine() -> Machine {
        Machine::new(client_config(), ProbeConfig::new())
    }

    fn machine_with(config: ProbeConfig) -> Machine {
        Machine::new(client_config(), config)
    }

    fn reply(xid: u32, msg_type: MessageType) -> Message {
        let mut msg = Message::new(BootpOp::Reply);
        msg.xid = xid;
        msg.chaddr[..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        msg.push_option(opt::MESSAGE_TYPE, &[msg_type as u8]);
        msg
    }

    fn offer(xid: u32, yiaddr: Ipv4Addr, server: Ipv4Addr, lease_secs: u32) -> Message {
        let mut msg = reply(xid, MessageType::Offer);
        msg.yiaddr = yiaddr;
        msg.push_option(opt::SERVER_ID, &server.octets());
        msg.push_option(opt::LEASE_TIME, &lease_secs.to_be_bytes());
        msg
    }

    fn ack(xid: u32, yiaddr: Ipv4Addr, server: Ipv4Addr, lease_secs: u32) -> Message {
        let mut msg = reply(xid, MessageType::Ack);
        msg.yiaddr = yiaddr;
        msg.push_option(opt::SERVER_ID, &server.octets());
        msg.push_option(opt::LEASE_TIME, &lease_secs.to_be_bytes());
        msg.push_option(opt::SUBNET_MASK, &[255, 255, 255, 0]);
        msg.push_option(opt::RENEWAL_TIME, &1800u32.to_be_bytes());
        msg.push_option(opt::REBINDING_TIME, &3150u32.to_be_bytes());
        msg
    }

    fn sent_messages(effects: &[Effect]) -> Vec<&Message> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Broadcast { msg, .. } => Some(msg),
                Effect::Unicast(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    fn events(effects: &[Effect]) -> Vec<&Event> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Notify(ev) => Some(ev),
                _ => None,
            })
            .collect()
    }

    /// Drive a fresh machine to GRANTED; returns (machine, base instant).
    fn granted_machine(lease_secs: u32) -> (Machine, Instant) {
        let now = Instant::now();
        let mut m = machine();
        m.start(now);
        let xid = m.xid();

        let off = offer(xid, Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), lease_secs);
        let fx = m.handle_message(&off, now);
        let lease = match events(&fx)[0] {
            Event::Offer(l) => l.clone(),
            other => panic!("expected offer event, got {:?}", other),
        };
        m.select(&lease, now).unwrap();

        let a = ack(xid, Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), lease_secs);
        let fx = m.handle_message(&a, now);
        assert!(matches!(events(&fx)[0], Event::Granted(_)));
        assert_eq!(m.state(), State::Granted);
        (m, now)
    }

    /// Drive a fresh machine all the way to BOUND.
    fn bound_machine(lease_secs: u32) -> (Machine, Instant) {
        let (mut m, now) = granted_machine(lease_secs);
        let fx = m.accept(now).unwrap();
        assert!(matches!(fx[0], Effect::CloseRaw));
        assert!(matches!(fx[1], Effect::OpenUdp { .. }));
        assert_eq!(m.state(), State::Bound);
        (m, now)
    }

    #[test]
    fn test_start_opens_raw_and_discovers() {
        let now = Instant::now();
        let mut m = machine();
        let fx = m.start(now);

        assert!(matches!(fx[0], Effect::OpenRaw { .. }));
        let sent = sent_messages(&fx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type(), Some(MessageType::Discover));
        assert_eq!(sent[0].xid, m.xid());
        assert!(sent[0].is_broadcast());
        assert_eq!(m.state(), State::Selecting);

        // First retransmit lands at 4s +- 1s
        let deadline = m.next_deadline().unwrap();
        let delta = deadline.duration_since(now);
        assert!(delta >= Duration::from_secs(3) && delta <= Duration::from_secs(5));
    }

    #[test]
    fn test_happy_path_offer_select_grant() {
        let now = Instant::now();
        let mut m = machine();
        m.start(now);
        let xid = m.xid();

        // Server at 10.0.0.1 offers 10.0.0.42
        let off = offer(xid, Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), 3600);
        let fx = m.handle_message(&off, now);
        let lease = match events(&fx)[0] {
            Event::Offer(l) => l.clone(),
            other => panic!("expected offer, got {:?}", other),
        };
        assert_eq!(m.state(), State::Selecting);

        let fx = m.select(&lease, now).unwrap();
        let sent = sent_messages(&fx);
        assert_eq!(sent[0].message_type(), Some(MessageType::Request));
        assert_eq!(sent[0].requested_ip(), Some(Ipv4Addr::new(10, 0, 0, 42)));
        assert_eq!(sent[0].server_id(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(m.state(), State::Requesting);

        let a = ack(xid, Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), 3600);
        let fx = m.handle_message(&a, now);
        match events(&fx)[0] {
            Event::Granted(l) => {
                assert_eq!(l.query_u32(51), Some(3600));
                assert_eq!(l.address(), Ipv4Addr::new(10, 0, 0, 42));
            }
            other => panic!("expected granted, got {:?}", other),
        }
    }

    #[test]
    fn test_accept_first_offer_policy() {
        let now = Instant::now();
        let mut cfg = ProbeConfig::new();
        cfg.set_accept_first_offer(true);
        let mut m = machine_with(cfg);
        m.start(now);
        let xid = m.xid();

        let off = offer(xid, Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), 3600);
        let fx = m.handle_message(&off, now);
        // Straight to REQUESTING, no offer event
        assert!(events(&fx).is_empty());
        assert_eq!(m.state(), State::Requesting);
        assert_eq!(
            sent_messages(&fx)[0].message_type(),
            Some(MessageType::Request)
        );
    }

    #[test]
    fn test_selection_window_falls_back_to_first_offer() {
        let now = Instant::now();
        let mut m = machine();
        m.start(now);
        let xid = m.xid();

        let off = offer(xid, Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), 3600);
        m.handle_message(&off, now);
        let off2 = offer(xid, Ipv4Addr::new(10, 0, 0, 43), Ipv4Addr::new(10, 0, 0, 2), 3600);
        m.handle_message(&off2, now);

        let fx = m.handle_timeout(now + SELECTION_WINDOW);
        assert_eq!(m.state(), State::Requesting);
        let sent = sent_messages(&fx);
        assert_eq!(sent[0].server_id(), Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_duplicate_offer_ignored() {
        let now = Instant::now();
        let mut m = machine();
        m.start(now);
        let xid = m.xid();

        let off = offer(xid, Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), 3600);
        assert_eq!(events(&m.handle_message(&off, now)).len(), 1);
        assert!(m.handle_message(&off, now).is_empty());
    }

    #[test]
    fn test_nak_retracts_to_init() {
        let now = Instant::now();
        let mut m = machine();
        m.start(now);
        let xid = m.xid();

        let off = offer(xid, Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), 3600);
        let fx = m.handle_message(&off, now);
        let lease = match events(&fx)[0] {
            Event::Offer(l) => l.clone(),
            _ => unreachable!(),
        };
        m.select(&lease, now).unwrap();

        let mut nak = reply(xid, MessageType::Nak);
        nak.push_option(opt::MESSAGE, b"lease expired");
        let fx = m.handle_message(&nak, now);

        assert!(matches!(events(&fx)[0], Event::Retracted));
        assert_eq!(m.state(), State::Init);
        assert!(m.lease().is_none());
    }

    #[test]
    fn test_foreign_xid_ignored_and_timer_untouched() {
        let now = Instant::now();
        let mut m = machine();
        m.start(now);
        let deadline = m.next_deadline();

        let off = offer(0x1234_0000 ^ m.xid(), Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), 3600);
        let fx = m.handle_message(&off, now);
        assert!(fx.is_empty());
        assert_eq!(m.state(), State::Selecting);
        assert_eq!(m.next_deadline(), deadline);
    }

    #[test]
    fn test_discover_backoff_doubles_and_caps() {
        let mut now = Instant::now();
        let mut m = machine();
        m.start(now);

        let mut prev = Duration::ZERO;
        for round in 0..8 {
            let deadline = m.next_deadline().unwrap();
            now = deadline;
            let fx = m.handle_timeout(now);
            let sent = sent_messages(&fx);
            assert_eq!(sent.len(), 1, "round {}", round);
            assert_eq!(sent[0].message_type(), Some(MessageType::Discover));

            let next = m.next_deadline().unwrap().duration_since(now);
            // Jittered around 8, 16, 32, 64, 64... never above 65s
            assert!(next <= Duration::from_secs(65), "round {}: {:?}", round, next);
            assert!(next + Duration::from_secs(2) >= prev, "delays should grow");
            prev = next;
        }
        // Capped: the last interval is 64 +- 1
        assert!(prev >= Duration::from_secs(63));
    }

    #[test]
    fn test_requesting_gives_up_and_retracts() {
        let mut now = Instant::now();
        let mut m = machine();
        m.start(now);
        let xid = m.xid();

        let off = offer(xid, Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), 3600);
        let fx = m.handle_message(&off, now);
        let lease = match events(&fx)[0] {
            Event::Offer(l) => l.clone(),
            _ => unreachable!(),
        };
        m.select(&lease, now).unwrap();

        let mut retracted = false;
        for _ in 0..REQUESTING_MAX_ATTEMPTS {
            now = m.next_deadline().unwrap();
            let fx = m.handle_timeout(now);
            if events(&fx)
                .iter()
                .any(|e| matches!(e, Event::Retracted))
            {
                retracted = true;
                break;
            }
        }
        assert!(retracted);
        assert_eq!(m.state(), State::Init);
    }

    #[test]
    fn test_init_reboot_requests_prior_address() {
        let now = Instant::now();
        let mut cfg = ProbeConfig::new();
        cfg.set_init_reboot(true)
            .set_requested_ip(Ipv4Addr::new(10, 0, 0, 42));
        let mut m = machine_with(cfg);
        let fx = m.start(now);

        assert_eq!(m.state(), State::Rebooting);
        let sent = sent_messages(&fx);
        assert_eq!(sent[0].message_type(), Some(MessageType::Request));
        assert_eq!(sent[0].requested_ip(), Some(Ipv4Addr::new(10, 0, 0, 42)));
        assert_eq!(sent[0].server_id(), None);
    }

    #[test]
    fn test_init_reboot_falls_back_to_discover() {
        let mut now = Instant::now();
        let mut cfg = ProbeConfig::new();
        cfg.set_init_reboot(true)
            .set_requested_ip(Ipv4Addr::new(10, 0, 0, 42));
        let mut m = machine_with(cfg);
        m.start(now);

        // Two unanswered REQUESTs, then discovery
        now = m.next_deadline().unwrap();
        let fx = m.handle_timeout(now);
        assert_eq!(
            sent_messages(&fx)[0].message_type(),
            Some(MessageType::Request)
        );
        assert_eq!(m.state(), State::Rebooting);

        now = m.next_deadline().unwrap();
        let fx = m.handle_timeout(now);
        assert_eq!(
            sent_messages(&fx)[0].message_type(),
            Some(MessageType::Discover)
        );
        assert_eq!(m.state(), State::Selecting);
    }

    #[test]
    fn test_init_reboot_ack_grants() {
        let now = Instant::now();
        let mut cfg = ProbeConfig::new();
        cfg.set_init_reboot(true)
            .set_requested_ip(Ipv4Addr::new(10, 0, 0, 42));
        let mut m = machine_with(cfg);
        m.start(now);

        let a = ack(m.xid(), Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), 3600);
        let fx = m.handle_message(&a, now);
        assert!(matches!(events(&fx)[0], Event::Granted(_)));
        assert_eq!(m.state(), State::Granted);
    }

    #[test]
    fn test_t1_starts_renewal_unicast() {
        let (mut m, now) = bound_machine(3600);

        let t1 = now + Duration::from_secs(1800);
        assert_eq!(m.next_deadline(), Some(t1));

        let fx = m.handle_timeout(t1);
        assert_eq!(m.state(), State::Renewing);
        assert!(matches!(fx[0], Effect::Unicast(_)));
        let sent = sent_messages(&fx);
        assert_eq!(sent[0].message_type(), Some(MessageType::Request));
        assert_eq!(sent[0].ciaddr, Ipv4Addr::new(10, 0, 0, 42));
        // Renew REQUEST carries neither option 50 nor 54
        assert_eq!(sent[0].requested_ip(), None);
        assert_eq!(sent[0].server_id(), None);
    }

    #[test]
    fn test_renewal_ack_extends() {
        let (mut m, now) = bound_machine(3600);
        let xid = m.xid();

        let t1 = now + Duration::from_secs(1800);
        m.handle_timeout(t1);

        let a = ack(xid, Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), 3600);
        let fx = m.handle_message(&a, t1);
        assert!(matches!(events(&fx)[0], Event::Extended(_)));
        assert_eq!(m.state(), State::Bound);
        // Timers recomputed from the new acquisition instant
        assert_eq!(m.next_deadline(), Some(t1 + Duration::from_secs(1800)));
    }

    #[test]
    fn test_lost_ack_rebinds_and_second_server_extends() {
        let (mut m, now) = bound_machine(3600);
        let xid = m.xid();

        // T1: renewal starts, no ACK ever arrives
        let t1 = now + Duration::from_secs(1800);
        m.handle_timeout(t1);
        assert_eq!(m.state(), State::Renewing);

        // T2: broadcast REQUEST through a fresh raw socket
        let t2 = now + Duration::from_secs(3150);
        let fx = m.handle_timeout(t2);
        assert_eq!(m.state(), State::Rebinding);
        assert!(matches!(fx[0], Effect::CloseUdp));
        assert!(matches!(fx[1], Effect::OpenRaw { .. }));
        match &fx[2] {
            Effect::Broadcast { msg, src } => {
                assert_eq!(msg.message_type(), Some(MessageType::Request));
                assert_eq!(*src, Ipv4Addr::new(10, 0, 0, 42));
            }
            other => panic!("expected broadcast, got {:?}", other),
        }

        // A second server ACKs with the same address and a 7200s lease
        let a = ack(xid, Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 9), 7200);
        let fx = m.handle_message(&a, t2);
        let evs = events(&fx);
        assert_eq!(evs.len(), 1);
        match evs[0] {
            Event::Extended(l) => {
                assert_eq!(l.query_u32(51), Some(7200));
                assert_eq!(l.server_id(), Ipv4Addr::new(10, 0, 0, 9));
            }
            other => panic!("expected extended, got {:?}", other),
        }
        assert_eq!(m.state(), State::Bound);
        assert!(matches!(fx[0], Effect::CloseRaw));
        assert!(
            matches!(fx[1], Effect::OpenUdp { server, .. } if server == Ipv4Addr::new(10, 0, 0, 9))
        );
    }

    #[test]
    fn test_expiry_emits_and_goes_quiet() {
        let (mut m, now) = bound_machine(3600);

        // Ride through T1 and T2 without any ACK
        m.handle_timeout(now + Duration::from_secs(1800));
        m.handle_timeout(now + Duration::from_secs(3150));
        assert_eq!(m.state(), State::Rebinding);

        let fx = m.handle_timeout(now + Duration::from_secs(3600));
        assert!(events(&fx).iter().any(|e| matches!(e, Event::Expired)));
        assert_eq!(m.state(), State::Expired);
        assert!(m.lease().is_none());

        // No further events until the host restarts
        assert!(m.next_deadline().is_none());
        assert!(m.handle_timeout(now + Duration::from_secs(9000)).is_empty());
    }

    #[test]
    fn test_timers_fire_in_t1_t2_expiry_order() {
        let (mut m, now) = bound_machine(3600);
        let t1 = m.next_deadline().unwrap();
        m.handle_timeout(t1);
        let t2 = m.next_deadline().unwrap().max(t1);
        assert!(t1 <= t2);
        // Skip retransmits by jumping straight to T2
        m.handle_timeout(now + Duration::from_secs(3150));
        assert_eq!(m.state(), State::Rebinding);
        let expiry = now + Duration::from_secs(3600);
        assert!(now + Duration::from_secs(3150) <= expiry);
    }

    #[test]
    fn test_renew_retry_interval_floor() {
        let (mut m, now) = bound_machine(3600);
        let t1 = now + Duration::from_secs(1800);
        m.handle_timeout(t1);

        // (T2 - now) / 2 = 675s at first retry
        let next = m.next_deadline().unwrap().duration_since(t1);
        assert_eq!(next, Duration::from_secs(675));

        // Close to T2 the interval floors at 60s
        let late = now + Duration::from_secs(3100);
        assert_eq!(m.renew_interval(late), MIN_RETRY_INTERVAL);
    }

    #[test]
    fn test_decline_sends_server_and_address() {
        let (mut m, now) = granted_machine(3600);

        let fx = m.decline("address in use", now).unwrap();
        let sent = sent_messages(&fx);
        assert_eq!(sent[0].message_type(), Some(MessageType::Decline));
        assert_eq!(sent[0].server_id(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(sent[0].requested_ip(), Some(Ipv4Addr::new(10, 0, 0, 42)));

        assert_eq!(m.state(), State::Init);
        assert!(m.lease().is_none());
    }

    #[test]
    fn test_release_unicasts_and_cancels() {
        let (mut m, now) = bound_machine(3600);

        let fx = m.release(now).unwrap();
        assert!(matches!(fx[0], Effect::Unicast(_)));
        let sent = sent_messages(&fx);
        assert_eq!(sent[0].message_type(), Some(MessageType::Release));
        assert_eq!(sent[0].ciaddr, Ipv4Addr::new(10, 0, 0, 42));
        assert!(events(&fx).iter().any(|e| matches!(e, Event::Cancelled)));
        assert_eq!(m.state(), State::Cancelled);
    }

    #[test]
    fn test_cancel_closes_sockets_and_notifies() {
        let now = Instant::now();
        let mut m = machine();
        m.start(now);

        let fx = m.cancel();
        assert!(matches!(fx[0], Effect::CloseRaw));
        assert!(matches!(fx[1], Effect::CloseUdp));
        assert!(matches!(events(&fx)[0], Event::Cancelled));
        assert_eq!(m.state(), State::Cancelled);
        assert!(m.cancel().is_empty());
    }

    #[test]
    fn test_xid_constant_across_probe() {
        let mut now = Instant::now();
        let mut m = machine();
        let mut all_sent: Vec<u32> = Vec::new();

        let fx = m.start(now);
        all_sent.extend(sent_messages(&fx).iter().map(|s| s.xid));

        // A couple of retransmits
        for _ in 0..2 {
            now = m.next_deadline().unwrap();
            let fx = m.handle_timeout(now);
            all_sent.extend(sent_messages(&fx).iter().map(|s| s.xid));
        }

        let xid = m.xid();
        let off = offer(xid, Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), 3600);
        let fx = m.handle_message(&off, now);
        let lease = match events(&fx)[0] {
            Event::Offer(l) => l.clone(),
            _ => unreachable!(),
        };
        let fx = m.select(&lease, now).unwrap();
        all_sent.extend(sent_messages(&fx).iter().map(|s| s.xid));

        assert!(all_sent.iter().all(|&x| x == xid));
    }

    #[test]
    fn test_inform_only_probe() {
        let now = Instant::now();
        let mut cfg = ProbeConfig::new();
        cfg.set_inform_only(true)
            .set_requested_ip(Ipv4Addr::new(10, 0, 0, 7));
        let mut m = machine_with(cfg);
        let fx = m.start(now);

        let sent = sent_messages(&fx);
        assert_eq!(sent[0].message_type(), Some(MessageType::Inform));
        assert_eq!(sent[0].ciaddr, Ipv4Addr::new(10, 0, 0, 7));

        let mut a = reply(m.xid(), MessageType::Ack);
        a.push_option(opt::SERVER_ID, &[10, 0, 0, 1]);
        a.push_option(opt::DNS_SERVER, &[10, 0, 0, 53]);
        let fx = m.handle_message(&a, now);
        assert!(matches!(events(&fx)[0], Event::Granted(_)));

        let fx = m.accept(now).unwrap();
        assert!(matches!(fx[0], Effect::CloseRaw));
        assert_eq!(fx.len(), 1);
        assert!(m.next_deadline().is_none());
    }

    #[test]
    fn test_granted_lease_expires_without_accept() {
        let (mut m, now) = granted_machine(3600);
        let fx = m.handle_timeout(now + Duration::from_secs(3600));
        assert!(events(&fx).iter().any(|e| matches!(e, Event::Expired)));
        assert_eq!(m.state(), State::Expired);
    }

    #[test]
    fn test_select_rejects_unknown_lease() {
        let now = Instant::now();
        let mut m = machine();
        m.start(now);
        let xid = m.xid();

        let off = offer(xid, Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), 3600);
        m.handle_message(&off, now);

        let foreign = Arc::new(
            Lease::from_offer(
                &offer(xid, Ipv4Addr::new(10, 9, 9, 9), Ipv4Addr::new(10, 9, 9, 1), 60),
                now,
            )
            .unwrap(),
        );
        assert!(m.select(&foreign, now).is_err());
    }

    #[test]
    fn test_ack_missing_lease_time_ignored() {
        let now = Instant::now();
        let mut m = machine();
        m.start(now);
        let xid = m.xid();

        let off = offer(xid, Ipv4Addr::new(10, 0, 0, 42), Ipv4Addr::new(10, 0, 0, 1), 3600);
        let fx = m.handle_message(&off, now);
        let lease = match events(&fx)[0] {
            Event::Offer(l) => l.clone(),
            _ => unreachable!(),
        };
        m.select(&lease, now).unwrap();
        let deadline = m.next_deadline();

        let mut bad = reply(xid, MessageType::Ack);
        bad.yiaddr = Ipv4Addr::new(10, 0, 0, 42);
        bad.push_option(opt::SERVER_ID, &[10, 0, 0, 1]);
        let fx = m.handle_message(&bad, now);

        // Malformed: dropped without a state change or timer disturbance
        assert!(fx.is_empty());
        assert_eq!(m.state(), State::Requesting);
        assert_eq!(m.next_deadline(), deadline);
    }
}
