//! Packet transport.
//!
//! Two sending/receiving paths: a raw AF_PACKET socket with an attached
//! reply filter for the states where the interface has no usable address,
//! and a connected UDP socket once a lease is bound. Send is single-attempt
//! best-effort either way; the state machine's timers drive retransmission.

pub mod checksum;
pub mod filter;
mod raw;
mod udp;

pub use raw::RawSocket;
pub use udp::BoundUdpSocket;
