//! The client façade.
//!
//! One [`Client`] drives one interface. The host adds [`Client::fd`] to its
//! poll set and calls [`Client::dispatch`] whenever it turns readable;
//! dispatch drains the probe's sockets, fires due timers, applies the
//! machine's effects and queues events for [`Client::pop_event`]. Nothing
//! here blocks and no threads are spawned.

use crate::config::{ClientConfig, ProbeConfig};
use crate::event::{Event, EventQueue};
use crate::lease::Lease;
use crate::poll::Epoll;
use crate::probe::{Effect, Machine, State};
use crate::proto::Message;
use crate::timer::{Clock, MonotonicClock, TimerFd};
use crate::transport::{BoundUdpSocket, RawSocket};
use crate::{Error, Result};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Machine plus the effects host-side probe operations have queued for the
/// next dispatch.
struct ProbeShared {
    machine: Machine,
    pending: Vec<Effect>,
}

struct ActiveProbe {
    shared: Arc<Mutex<ProbeShared>>,
    cancelled: Arc<AtomicBool>,
    raw: Option<RawSocket>,
    udp: Option<BoundUdpSocket>,
}

pub struct Client {
    config: ClientConfig,
    epoll: Epoll,
    timer: Arc<TimerFd>,
    clock: Arc<dyn Clock>,
    events: EventQueue,
    active: Option<ActiveProbe>,
    disabled: bool,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock))
    }

    /// Construction with an injected time source, for tests and simulators.
    pub fn with_clock(config: ClientConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let epoll = Epoll::new()?;
        let timer = TimerFd::new()?;
        epoll.add(timer.as_raw_fd())?;
        Ok(Self {
            config,
            epoll,
            timer: Arc::new(timer),
            clock,
            events: EventQueue::default(),
            active: None,
            disabled: false,
        })
    }

    /// The readable descriptor for the host's poll set. Readable whenever a
    /// `dispatch()` would do work.
    pub fn fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }

    /// Pop the next queued notification, oldest first.
    pub fn pop_event(&mut self) -> Option<Event> {
        self.events.pop()
    }

    /// Adjust the send path's maximum DHCP payload to a new interface MTU.
    pub fn update_mtu(&mut self, mtu: u16) {
        self.config.set_mtu(mtu);
        if let Some(active) = &self.active {
            active.shared.lock().expect("probe lock").machine.set_mtu(mtu);
        }
    }

    /// Start an acquisition. Fails with [`Error::Preempted`] while another
    /// probe is live on this client.
    pub fn probe(&mut self, config: ProbeConfig) -> Result<Probe> {
        if self.disabled {
            return Err(Error::InvalidState(
                "client is down, recreate it first".into(),
            ));
        }
        config.validate()?;

        if let Some(active) = &self.active {
            let live = active.shared.lock().expect("probe lock").machine.state().is_live();
            if live {
                return Err(Error::Preempted("a probe is already active".into()));
            }
        }
        // A finished probe's sockets (if any) go away with the slot.
        self.drop_active();

        let mut machine = Machine::new(self.config.clone(), config);
        let now = self.clock.now();
        let effects = machine.start(now);

        let shared = Arc::new(Mutex::new(ProbeShared {
            machine,
            pending: Vec::new(),
        }));
        let cancelled = Arc::new(AtomicBool::new(false));
        self.active = Some(ActiveProbe {
            shared: shared.clone(),
            cancelled: cancelled.clone(),
            raw: None,
            udp: None,
        });

        if let Err(e) = self.apply_effects(effects) {
            self.fail(&e);
            return Err(e);
        }
        self.rearm(now);

        Ok(Probe {
            shared,
            cancelled,
            clock: self.clock.clone(),
            kick: self.timer.clone(),
        })
    }

    /// Drain sockets and timers. Non-blocking, idempotent when idle, not
    /// reentrant. Inbound packets are always processed before timer-driven
    /// transitions.
    pub fn dispatch(&mut self) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        self.timer.clear();
        let now = self.clock.now();

        if let Err(e) = self.dispatch_inner(now) {
            self.fail(&e);
            return Err(e);
        }
        self.rearm(now);
        Ok(())
    }

    fn dispatch_inner(&mut self, now: Instant) -> Result<()> {
        let Some(active) = &self.active else {
            return Ok(());
        };

        // Host-side probe operations queued since the last dispatch.
        let pending = {
            let mut shared = active.shared.lock().expect("probe lock");
            std::mem::take(&mut shared.pending)
        };
        self.apply_effects(pending)?;

        // A dropped or cancelled handle cancels the probe here.
        if let Some(active) = &self.active {
            if active.cancelled.swap(false, Ordering::AcqRel) {
                let effects = active.shared.lock().expect("probe lock").machine.cancel();
                self.apply_effects(effects)?;
            }
        }

        self.drain_raw(now)?;
        self.drain_udp(now)?;

        if let Some(active) = &self.active {
            let effects = {
                let mut shared = active.shared.lock().expect("probe lock");
                shared.machine.handle_timeout(now)
            };
            self.apply_effects(effects)?;
        }
        Ok(())
    }

    fn drain_raw(&mut self, now: Instant) -> Result<()> {
        loop {
            let payload = {
                let Some(active) = &self.active else { return Ok(()) };
                let Some(raw) = &active.raw else { return Ok(()) };
                let xid = active.shared.lock().expect("probe lock").machine.xid();
                raw.recv(xid)?
            };
            let Some(payload) = payload else { return Ok(()) };
            self.deliver(&payload, now)?;
        }
    }

    fn drain_udp(&mut self, now: Instant) -> Result<()> {
        loop {
            let payload = {
                let Some(active) = &self.active else { return Ok(()) };
                let Some(udp) = &active.udp else { return Ok(()) };
                udp.recv()?
            };
            let Some(payload) = payload else { return Ok(()) };
            self.deliver(&payload, now)?;
        }
    }

    fn deliver(&mut self, payload: &[u8], now: Instant) -> Result<()> {
        let msg = match Message::decode(payload) {
            Ok(m) => m,
            Err(e) => {
                // Malformed traffic never advances state or touches timers.
                debug!(error = %e, "dropping malformed datagram");
                return Ok(());
            }
        };
        let Some(active) = &self.active else {
            return Ok(());
        };
        let effects = {
            let mut shared = active.shared.lock().expect("probe lock");
            shared.machine.handle_message(&msg, now)
        };
        self.apply_effects(effects)
    }

    fn apply_effects(&mut self, effects: Vec<Effect>) -> Result<()> {
        for effect in effects {
            match effect {
                Effect::OpenRaw { xid } => {
                    let sock = RawSocket::open(
                        self.config.ifindex,
                        xid,
                        &self.config.broadcast_mac,
                        self.config.strict_destination,
                    )?;
                    self.epoll.add(sock.as_raw_fd())?;
                    if let Some(active) = &mut self.active {
                        if let Some(old) = active.raw.take() {
                            self.epoll.remove(old.as_raw_fd());
                        }
                        active.raw = Some(sock);
                    }
                }
                Effect::CloseRaw => {
                    if let Some(active) = &mut self.active {
                        if let Some(sock) = active.raw.take() {
                            self.epoll.remove(sock.as_raw_fd());
                        }
                    }
                }
                Effect::OpenUdp { local, server } => {
                    let sock = BoundUdpSocket::open(self.config.ifindex, local, server)?;
                    self.epoll.add(sock.as_raw_fd())?;
                    if let Some(active) = &mut self.active {
                        if let Some(old) = active.udp.take() {
                            self.epoll.remove(old.as_raw_fd());
                        }
                        active.udp = Some(sock);
                    }
                }
                Effect::CloseUdp => {
                    if let Some(active) = &mut self.active {
                        if let Some(sock) = active.udp.take() {
                            self.epoll.remove(sock.as_raw_fd());
                        }
                    }
                }
                Effect::Broadcast { msg, src } => {
                    let bytes = msg.encode(self.config.max_message_size())?;
                    if let Some(active) = &self.active {
                        if let Some(raw) = &active.raw {
                            self.send_checked(raw.send(src, &bytes))?;
                        } else {
                            warn!("broadcast requested without a raw socket");
                        }
                    }
                }
                Effect::Unicast(msg) => {
                    let bytes = msg.encode(self.config.max_message_size())?;
                    if let Some(active) = &self.active {
                        if let Some(udp) = &active.udp {
                            self.send_checked(udp.send(&bytes))?;
                        } else {
                            warn!("unicast requested without a bound socket");
                        }
                    }
                }
                Effect::Notify(event) => {
                    self.events.push(event);
                }
            }
        }
        Ok(())
    }

    /// Transient send failures are swallowed; the retransmit timer covers
    /// the lost message.
    fn send_checked(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                debug!(error = %e, "transient send failure, timer will retry");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Fatal I/O: release everything, tell the host, go quiet until it
    /// recreates the client.
    fn fail(&mut self, err: &Error) {
        error!(error = %err, "fatal I/O error, client down");
        self.drop_active();
        self.events.push(Event::Down);
        self.disabled = true;
    }

    fn drop_active(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Some(sock) = active.raw.take() {
                self.epoll.remove(sock.as_raw_fd());
            }
            if let Some(sock) = active.udp.take() {
                self.epoll.remove(sock.as_raw_fd());
            }
        }
    }

    fn rearm(&self, now: Instant) {
        let deadline = self
            .active
            .as_ref()
            .and_then(|a| a.shared.lock().expect("probe lock").machine.next_deadline());
        let timeout = deadline.map(|d| d.saturating_duration_since(now));
        if let Err(e) = self.timer.arm(timeout) {
            warn!(error = %e, "failed to arm dispatch timer");
        }
    }
}

/// The host's handle to a running acquisition.
///
/// Operations take effect at the next `dispatch()`; each one nudges the
/// client's descriptor so the host's poll loop comes back around. Dropping
/// the handle cancels the probe the same way.
pub struct Probe {
    shared: Arc<Mutex<ProbeShared>>,
    cancelled: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    kick: Arc<TimerFd>,
}

impl Probe {
    pub fn state(&self) -> State {
        self.shared.lock().expect("probe lock").machine.state()
    }

    pub fn lease(&self) -> Option<Arc<Lease>> {
        self.shared.lock().expect("probe lock").machine.lease().cloned()
    }

    /// Promote one of the buffered offers: SELECTING -> REQUESTING.
    pub fn select(&self, lease: &Arc<Lease>) -> Result<()> {
        let now = self.clock.now();
        let mut shared = self.shared.lock().expect("probe lock");
        let effects = shared.machine.select(lease, now)?;
        shared.pending.extend(effects);
        drop(shared);
        self.kick();
        Ok(())
    }

    /// Confirm a granted lease. Required before the host may treat the
    /// interface as configured; opens the unicast renewal path.
    pub fn accept(&self) -> Result<()> {
        let now = self.clock.now();
        let mut shared = self.shared.lock().expect("probe lock");
        let effects = shared.machine.accept(now)?;
        shared.pending.extend(effects);
        drop(shared);
        self.kick();
        Ok(())
    }

    /// Refuse a granted lease, e.g. after detecting the address in use.
    pub fn decline(&self, reason: &str) -> Result<()> {
        let now = self.clock.now();
        let mut shared = self.shared.lock().expect("probe lock");
        let effects = shared.machine.decline(reason, now)?;
        shared.pending.extend(effects);
        drop(shared);
        self.kick();
        Ok(())
    }

    /// Return the bound address to the server and end the probe.
    pub fn release(&self) -> Result<()> {
        let now = self.clock.now();
        let mut shared = self.shared.lock().expect("probe lock");
        let effects = shared.machine.release(now)?;
        shared.pending.extend(effects);
        drop(shared);
        self.kick();
        Ok(())
    }

    /// Cancel the acquisition. Sockets are released and `Cancelled` is
    /// emitted during the next dispatch.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.kick();
    }

    /// Make the client's descriptor readable so the host dispatches soon.
    fn kick(&self) {
        if let Err(e) = self.kick.arm(Some(Duration::ZERO)) {
            warn!(error = %e, "failed to nudge dispatch timer");
        }
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;

    fn config() -> ClientConfig {
        let mut c = ClientConfig::new();
        c.set_ifindex(2)
            .set_mac(&[0x02, 0, 0, 0, 0, 0x01])
            .set_broadcast_mac(&[0xff; 6]);
        c
    }

    #[test]
    fn test_new_validates_config() {
        assert!(Client::new(ClientConfig::new()).is_err());
        assert!(Client::new(config()).is_ok());
    }

    #[test]
    fn test_fd_is_pollable_handle() {
        let client = Client::new(config()).unwrap();
        assert!(client.fd() >= 0);
    }

    #[test]
    fn test_dispatch_idle_is_idempotent() {
        let mut client = Client::new(config()).unwrap();
        client.dispatch().unwrap();
        client.dispatch().unwrap();
        assert!(client.pop_event().is_none());
    }

    #[test]
    fn test_probe_rejects_bad_config() {
        let mut client = Client::new(config()).unwrap();
        let mut pc = ProbeConfig::new();
        pc.set_init_reboot(true); // missing the prior address
        assert!(client.probe(pc).is_err());
    }

    #[test]
    fn test_rejects_infiniband_with_ethernet_mac() {
        let mut c = config();
        c.set_transport(Transport::Infiniband);
        assert!(Client::new(c).is_err());
    }
}
