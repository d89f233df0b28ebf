//! dhcp4c - an embeddable DHCPv4 client.
//!
//! One [`Client`] acquires, renews and releases IPv4 configuration on a
//! single interface on behalf of a host network manager that owns the event
//! loop. The host polls [`Client::fd`], calls [`Client::dispatch`] when it
//! turns readable, and drains notifications with [`Client::pop_event`];
//! address and route installation stay with the host.

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod lease;
pub mod logging;
pub mod poll;
pub mod probe;
pub mod proto;
pub mod timer;
pub mod transport;

pub use client::{Client, Probe};
pub use config::{ClientConfig, ProbeConfig, Transport};
pub use error::{Error, Result};
pub use event::Event;
pub use lease::Lease;
pub use probe::State;
