//! DHCP wire protocol - RFC 2131, 2132, 3396
//!
//! Message framing (fixed BOOTP header + magic cookie + TLV options) and the
//! constants shared by the transport and the state machine.

mod message;
mod options;

pub use message::{Message, MessageBuilder};
pub use options::{OptionIter, RawOption};

/// DHCP server port (bootps)
pub const SERVER_PORT: u16 = 67;

/// DHCP client port (bootpc)
pub const CLIENT_PORT: u16 = 68;

/// Fixed header size (before the magic cookie)
pub const HEADER_SIZE: usize = 236;

/// Magic cookie marking start of options (0x63825363)
pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Minimum message size (header + magic cookie + end option)
pub const MIN_MESSAGE_SIZE: usize = HEADER_SIZE + 4 + 1;

/// Legacy BOOTP minimum datagram payload; outbound messages are padded to it
pub const MIN_PACKET_SIZE: usize = 300;

/// Minimum DHCP datagram every server must accept (RFC 2131 §2)
pub const MIN_MAX_MESSAGE_SIZE: usize = 576;

/// BOOTP operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BootpOp {
    Request = 1,
    Reply = 2,
}

impl BootpOp {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(BootpOp::Request),
            2 => Some(BootpOp::Reply),
            _ => None,
        }
    }
}

/// DHCP message types (Option 53)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Discover),
            2 => Some(MessageType::Offer),
            3 => Some(MessageType::Request),
            4 => Some(MessageType::Decline),
            5 => Some(MessageType::Ack),
            6 => Some(MessageType::Nak),
            7 => Some(MessageType::Release),
            8 => Some(MessageType::Inform),
            _ => None,
        }
    }
}

/// DHCP option codes
pub mod opt {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS_SERVER: u8 = 6;
    pub const HOSTNAME: u8 = 12;
    pub const DOMAIN_NAME: u8 = 15;
    pub const BROADCAST_ADDR: u8 = 28;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const OVERLOAD: u8 = 52;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAMETER_REQUEST: u8 = 55;
    pub const MESSAGE: u8 = 56;
    pub const MAX_MESSAGE_SIZE: u8 = 57;
    pub const RENEWAL_TIME: u8 = 58;
    pub const REBINDING_TIME: u8 = 59;
    pub const CLIENT_ID: u8 = 61;
    pub const END: u8 = 255;
}

/// Overload flag values (option 52): which header fields carry options
pub mod overload {
    pub const FILE: u8 = 1;
    pub const SNAME: u8 = 2;
    pub const BOTH: u8 = 3;
}
