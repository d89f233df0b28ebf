//! DHCP message codec.
//!
//! [`Message`] is an owned decode/encode unit: the fixed BOOTP header plus
//! the concatenated option list. Encoding pads to the legacy 300-byte BOOTP
//! minimum and spills oversized option streams into the `file`/`sname`
//! header fields via the overload option (RFC 2132 §9.3).

use super::options::{append_tlv, merge_option, parse_region, tlv_len, RawOption};
use super::{opt, overload, BootpOp, MessageType, HEADER_SIZE, MAGIC_COOKIE, MIN_PACKET_SIZE};
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// A DHCP message in decoded form.
#[derive(Debug, Clone)]
pub struct Message {
    pub op: BootpOp,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    options: Vec<RawOption>,
}

/// Broadcast bit in the flags field (RFC 2131 §2)
pub const FLAG_BROADCAST: u16 = 0x8000;

impl Message {
    pub fn new(op: BootpOp) -> Self {
        Self {
            op,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0; 16],
            sname: [0; 64],
            file: [0; 128],
            options: Vec::new(),
        }
    }

    /// Decode a DHCP message from a datagram payload.
    ///
    /// Options are read from the options field, then `file`, then `sname`
    /// when the overload option says so; instances of the same code are
    /// concatenated (RFC 3396). Unknown codes are preserved verbatim.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE + 4 {
            return Err(Error::Parse(format!(
                "message too short ({} bytes)",
                buf.len()
            )));
        }
        if buf[HEADER_SIZE..HEADER_SIZE + 4] != MAGIC_COOKIE {
            return Err(Error::Parse("bad magic cookie".into()));
        }

        let op = BootpOp::from_u8(buf[0])
            .ok_or_else(|| Error::Parse(format!("bad op {}", buf[0])))?;

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&buf[28..44]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&buf[44..108]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&buf[108..236]);

        let mut options = Vec::new();
        parse_region(&buf[HEADER_SIZE + 4..], true, &mut options)?;

        // Overload (option 52): the sname/file header fields carry further
        // options. Parse order is options, file, sname.
        let ov = match options.iter().find(|o| o.code == opt::OVERLOAD) {
            Some(o) => {
                if o.data.len() != 1 || o.data[0] < overload::FILE || o.data[0] > overload::BOTH {
                    return Err(Error::Parse(format!("bad overload option {:?}", o.data)));
                }
                o.data[0]
            }
            None => 0,
        };
        if ov & overload::FILE != 0 {
            parse_region(&file, false, &mut options)?;
        }
        if ov & overload::SNAME != 0 {
            parse_region(&sname, false, &mut options)?;
        }

        Ok(Self {
            op,
            htype: buf[1],
            hlen: buf[2],
            hops: buf[3],
            xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            secs: u16::from_be_bytes([buf[8], buf[9]]),
            flags: u16::from_be_bytes([buf[10], buf[11]]),
            ciaddr: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            yiaddr: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
            siaddr: Ipv4Addr::new(buf[20], buf[21], buf[22], buf[23]),
            giaddr: Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27]),
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Encode into a datagram payload of at most `max_size` bytes.
    ///
    /// Options are emitted in caller order and terminated with END. If they
    /// do not fit the options field, whole options spill into `file` and
    /// then `sname`, announced by the overload option.
    pub fn encode(&self, max_size: usize) -> Result<Vec<u8>> {
        let opts_room = max_size.saturating_sub(HEADER_SIZE + 4 + 1);
        let total: usize = self.options.iter().map(|o| tlv_len(&o.data)).sum();

        let (main, in_file, in_sname) = if total <= opts_room {
            (self.options.as_slice(), &[][..], &[][..])
        } else {
            self.split_overloaded(opts_room)?
        };

        let mut opts_buf = Vec::with_capacity(total + 4);
        if !in_file.is_empty() || !in_sname.is_empty() {
            let flag = if in_sname.is_empty() {
                overload::FILE
            } else {
                overload::BOTH
            };
            append_tlv(&mut opts_buf, opt::OVERLOAD, &[flag]);
        }
        for o in main {
            append_tlv(&mut opts_buf, o.code, &o.data);
        }
        opts_buf.push(opt::END);

        let len = (HEADER_SIZE + 4 + opts_buf.len()).max(MIN_PACKET_SIZE);
        if len > max_size.max(MIN_PACKET_SIZE) {
            return Err(Error::Config(format!(
                "message does not fit {} bytes",
                max_size
            )));
        }

        let mut buf = vec![0u8; len];
        buf[0] = self.op as u8;
        buf[1] = self.htype;
        buf[2] = self.hlen;
        buf[3] = self.hops;
        buf[4..8].copy_from_slice(&self.xid.to_be_bytes());
        buf[8..10].copy_from_slice(&self.secs.to_be_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ciaddr.octets());
        buf[16..20].copy_from_slice(&self.yiaddr.octets());
        buf[20..24].copy_from_slice(&self.siaddr.octets());
        buf[24..28].copy_from_slice(&self.giaddr.octets());
        buf[28..44].copy_from_slice(&self.chaddr);
        buf[44..108].copy_from_slice(&self.sname);
        buf[108..236].copy_from_slice(&self.file);

        if !in_file.is_empty() {
            let mut region = Vec::with_capacity(128);
            for o in in_file {
                append_tlv(&mut region, o.code, &o.data);
            }
            region.push(opt::END);
            buf[108..108 + region.len()].copy_from_slice(&region);
        }
        if !in_sname.is_empty() {
            let mut region = Vec::with_capacity(64);
            for o in in_sname {
                append_tlv(&mut region, o.code, &o.data);
            }
            region.push(opt::END);
            buf[44..44 + region.len()].copy_from_slice(&region);
        }

        buf[236..240].copy_from_slice(&MAGIC_COOKIE);
        buf[240..240 + opts_buf.len()].copy_from_slice(&opts_buf);

        Ok(buf)
    }

    /// Greedy whole-option placement: options field first, then `file`
    /// (127 usable bytes + END), then `sname` (63 + END).
    fn split_overloaded(
        &self,
        opts_room: usize,
    ) -> Result<(&[RawOption], &[RawOption], &[RawOption])> {
        // The overload TLV itself takes 3 bytes of the options field.
        let main_room = opts_room.saturating_sub(3);
        let mut used = 0;
        let mut main_end = 0;
        for o in &self.options {
            let need = tlv_len(&o.data);
            if used + need > main_room {
                break;
            }
            used += need;
            main_end += 1;
        }

        let mut used = 0;
        let mut file_end = main_end;
        for o in &self.options[main_end..] {
            let need = tlv_len(&o.data);
            if used + need > 127 {
                break;
            }
            used += need;
            file_end += 1;
        }

        let mut used = 0;
        let mut sname_end = file_end;
        for o in &self.options[file_end..] {
            let need = tlv_len(&o.data);
            if used + need > 63 {
                break;
            }
            used += need;
            sname_end += 1;
        }

        if sname_end < self.options.len() {
            return Err(Error::Config(
                "options exceed message, file and sname capacity".into(),
            ));
        }

        Ok((
            &self.options[..main_end],
            &self.options[main_end..file_end],
            &self.options[file_end..sname_end],
        ))
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }

    /// All options in first-appearance order.
    pub fn options(&self) -> &[RawOption] {
        &self.options
    }

    /// Append an option value. A second append of the same code extends the
    /// existing value (the encoder re-splits as needed).
    pub fn push_option(&mut self, code: u8, data: &[u8]) {
        merge_option(&mut self.options, code, data);
    }

    /// Option payload by code.
    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|o| o.code == code)
            .map(|o| o.data.as_slice())
    }

    pub fn option_u32(&self, code: u8) -> Option<u32> {
        self.option(code).and_then(|d| {
            d.get(..4)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        })
    }

    pub fn option_ip(&self, code: u8) -> Option<Ipv4Addr> {
        self.option(code)
            .and_then(|d| d.get(..4).map(|b| Ipv4Addr::new(b[0], b[1], b[2], b[3])))
    }

    pub fn option_ip_list(&self, code: u8) -> Option<Vec<Ipv4Addr>> {
        self.option(code).map(|d| {
            d.chunks_exact(4)
                .map(|b| Ipv4Addr::new(b[0], b[1], b[2], b[3]))
                .collect()
        })
    }

    pub fn option_str(&self, code: u8) -> Option<&str> {
        self.option(code)
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\0'))
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.option(opt::MESSAGE_TYPE)
            .and_then(|d| d.first().copied())
            .and_then(MessageType::from_u8)
    }

    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.option_ip(opt::SERVER_ID)
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.option_ip(opt::REQUESTED_IP)
    }

    pub fn lease_time(&self) -> Option<u32> {
        self.option_u32(opt::LEASE_TIME)
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.option_ip(opt::SUBNET_MASK)
    }
}

/// Chained construction of outbound client messages.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    msg: Message,
}

impl MessageBuilder {
    pub fn new(op: BootpOp) -> Self {
        Self {
            msg: Message::new(op),
        }
    }

    pub fn xid(mut self, xid: u32) -> Self {
        self.msg.xid = xid;
        self
    }

    pub fn secs(mut self, secs: u16) -> Self {
        self.msg.secs = secs;
        self
    }

    pub fn broadcast(mut self, on: bool) -> Self {
        if on {
            self.msg.flags |= FLAG_BROADCAST;
        } else {
            self.msg.flags &= !FLAG_BROADCAST;
        }
        self
    }

    pub fn ciaddr(mut self, ip: Ipv4Addr) -> Self {
        self.msg.ciaddr = ip;
        self
    }

    /// Hardware identity. An empty `addr` encodes hlen = 0 with a zeroed
    /// chaddr, as Infiniband requires (RFC 4390).
    pub fn hardware(mut self, htype: u8, addr: &[u8]) -> Self {
        debug_assert!(addr.len() <= 16);
        self.msg.htype = htype;
        self.msg.hlen = addr.len() as u8;
        self.msg.chaddr = [0; 16];
        self.msg.chaddr[..addr.len()].copy_from_slice(addr);
        self
    }

    pub fn message_type(mut self, t: MessageType) -> Self {
        self.msg.push_option(opt::MESSAGE_TYPE, &[t as u8]);
        self
    }

    pub fn requested_ip(mut self, ip: Ipv4Addr) -> Self {
        self.msg.push_option(opt::REQUESTED_IP, &ip.octets());
        self
    }

    pub fn server_id(mut self, ip: Ipv4Addr) -> Self {
        self.msg.push_option(opt::SERVER_ID, &ip.octets());
        self
    }

    pub fn client_id(mut self, id: &[u8]) -> Self {
        self.msg.push_option(opt::CLIENT_ID, id);
        self
    }

    pub fn max_message_size(mut self, size: u16) -> Self {
        self.msg.push_option(opt::MAX_MESSAGE_SIZE, &size.to_be_bytes());
        self
    }

    pub fn parameter_request_list(mut self, codes: &[u8]) -> Self {
        self.msg.push_option(opt::PARAMETER_REQUEST, codes);
        self
    }

    /// Free-form text (option 56), carried on DECLINE.
    pub fn message(mut self, text: &str) -> Self {
        self.msg.push_option(opt::MESSAGE, text.as_bytes());
        self
    }

    pub fn build(self) -> Message {
        self.msg
    }
}
