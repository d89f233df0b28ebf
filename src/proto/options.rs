//! Option stream handling: TLV iteration, strict region parsing with the
//! RFC 3396 concatenation rule, and long-option splitting on encode.

use super::opt;
use crate::{Error, Result};

/// A single decoded option. Instances of the same code are concatenated
/// during decode, so `data` may be longer than 255 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOption {
    pub code: u8,
    pub data: Vec<u8>,
}

impl RawOption {
    pub fn new(code: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            data: data.into(),
        }
    }
}

/// Iterator over a raw TLV byte stream. Skips PAD, stops at END or at the
/// first truncated TLV. Use [`parse_region`] when malformed input must be
/// rejected rather than ignored.
pub struct OptionIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> OptionIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for OptionIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.data.len() {
            let code = self.data[self.pos];

            if code == opt::PAD {
                self.pos += 1;
                continue;
            }
            if code == opt::END {
                return None;
            }

            if self.pos + 1 >= self.data.len() {
                return None;
            }
            let len = self.data[self.pos + 1] as usize;
            let start = self.pos + 2;
            let end = start + len;
            if end > self.data.len() {
                return None;
            }

            self.pos = end;
            return Some((code, &self.data[start..end]));
        }
        None
    }
}

/// Append `(code, data)` to `out`, concatenating with an earlier instance of
/// the same code per RFC 3396. First-appearance order is preserved.
pub(crate) fn merge_option(out: &mut Vec<RawOption>, code: u8, data: &[u8]) {
    if let Some(existing) = out.iter_mut().find(|o| o.code == code) {
        existing.data.extend_from_slice(data);
    } else {
        out.push(RawOption::new(code, data));
    }
}

/// Strictly parse one option region (the options field, or an overloaded
/// `file`/`sname` field) into `out`.
///
/// `require_end` demands an END marker; the overloaded header fields may
/// instead run to the end of the field.
pub(crate) fn parse_region(
    region: &[u8],
    require_end: bool,
    out: &mut Vec<RawOption>,
) -> Result<()> {
    let mut pos = 0;

    while pos < region.len() {
        let code = region[pos];

        if code == opt::PAD {
            pos += 1;
            continue;
        }
        if code == opt::END {
            return Ok(());
        }

        if pos + 1 >= region.len() {
            return Err(Error::Parse(format!("option {} truncated", code)));
        }
        let len = region[pos + 1] as usize;
        let start = pos + 2;
        let end = start + len;
        if end > region.len() {
            return Err(Error::Parse(format!(
                "option {} overruns buffer ({} bytes past end)",
                code,
                end - region.len()
            )));
        }

        merge_option(out, code, &region[start..end]);
        pos = end;
    }

    if require_end {
        return Err(Error::Parse("option stream missing END marker".into()));
    }
    Ok(())
}

/// Append a TLV to an encode buffer. Values longer than 255 bytes are split
/// into successive TLVs with the same code (RFC 3396); decoders reassemble.
pub(crate) fn append_tlv(buf: &mut Vec<u8>, code: u8, data: &[u8]) {
    if data.is_empty() {
        buf.push(code);
        buf.push(0);
        return;
    }
    for chunk in data.chunks(255) {
        buf.push(code);
        buf.push(chunk.len() as u8);
        buf.extend_from_slice(chunk);
    }
}

/// Encoded size of a TLV including the per-chunk code/length overhead.
pub(crate) fn tlv_len(data: &[u8]) -> usize {
    if data.is_empty() {
        return 2;
    }
    let chunks = data.len().div_ceil(255);
    data.len() + 2 * chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iter_skips_pad_and_stops_at_end() {
        let stream = [0, 0, 53, 1, 2, 0, 255, 54, 4, 1, 2, 3, 4];
        let opts: Vec<_> = OptionIter::new(&stream).collect();
        assert_eq!(opts.len(), 1);
        assert_eq!(opts[0], (53, &[2u8][..]));
    }

    #[test]
    fn test_parse_region_concatenates_same_code() {
        // Two instances of option 121, split per RFC 3396
        let stream = [121, 2, 0xaa, 0xbb, 121, 1, 0xcc, 255];
        let mut out = Vec::new();
        parse_region(&stream, true, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code, 121);
        assert_eq!(out[0].data, vec![0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn test_parse_region_preserves_first_appearance_order() {
        let stream = [1, 1, 0x11, 2, 1, 0x22, 1, 1, 0x33, 255];
        let mut out = Vec::new();
        parse_region(&stream, true, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].code, 1);
        assert_eq!(out[0].data, vec![0x11, 0x33]);
        assert_eq!(out[1].code, 2);
    }

    #[test]
    fn test_parse_region_rejects_overrun() {
        let stream = [54, 10, 1, 2];
        let mut out = Vec::new();
        assert!(parse_region(&stream, true, &mut out).is_err());
    }

    #[test]
    fn test_parse_region_requires_end() {
        let stream = [53, 1, 2];
        let mut out = Vec::new();
        assert!(parse_region(&stream, true, &mut out).is_err());

        out.clear();
        parse_region(&stream, false, &mut out).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_append_tlv_splits_long_values() {
        let data = vec![0x5a; 300];
        let mut buf = Vec::new();
        append_tlv(&mut buf, 43, &data);

        // 255-byte chunk + 45-byte chunk
        assert_eq!(buf[0], 43);
        assert_eq!(buf[1], 255);
        assert_eq!(buf[2 + 255], 43);
        assert_eq!(buf[2 + 255 + 1], 45);
        assert_eq!(buf.len(), tlv_len(&data));

        let mut out = Vec::new();
        buf.push(255);
        parse_region(&buf, true, &mut out).unwrap();
        assert_eq!(out[0].data, data);
    }
}
