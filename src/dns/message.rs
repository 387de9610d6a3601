//! Parsing inbound queries and building outbound replies, RFC 1035 §4.1.

use packed_struct::prelude::*;

use crate::dns::header::Header;
use crate::enums::{RecordClass, RecordType};
use crate::error::DnsProxyError;

/// Maximum size of any packet this codec will build. The encoder never
/// grows past this; overflow is treated as a bug rather than truncated
/// silently, since every reply built here is a single question + single
/// answer and can never approach 16 KiB.
pub const MAX_PACKET_SIZE: usize = 16 * 1024;

/// A parsed DNS query: the header fields and question section the rest of
/// the pipeline needs. `raw` is not stored here — the caller (the client
/// I/O core) keeps the original byte slice as `OutstandingQuery::raw_query`
/// untouched, per spec.md's invariant that `raw_query` never changes shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub header: Header,
    /// Trailing-dot display form, e.g. `"www.example.com."` or `"."`.
    pub qname: String,
    /// The decoded labels, root-to-leaf order stripped of the trailing
    /// empty label, e.g. `["www", "example", "com"]`. Empty for the root
    /// name.
    pub qname_labels: Vec<Vec<u8>>,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

fn malformed(msg: impl Into<String>) -> DnsProxyError {
    DnsProxyError::MalformedQuery(msg.into())
}

/// Decodes the QNAME starting at `start`, returning the labels and the
/// offset in `buf` immediately following the name *as it appears at
/// `start`* (i.e. after the terminating zero byte, or after the 2-byte
/// pointer if the name is (partly) a pointer — never after a followed
/// jump, since QTYPE/QCLASS always sit right after the name's first
/// encoding in the original stream).
fn read_qname(buf: &[u8], start: usize) -> Result<(Vec<Vec<u8>>, usize), DnsProxyError> {
    let mut labels: Vec<Vec<u8>> = Vec::new();
    let mut cursor = start;
    let mut name_end: Option<usize> = None;
    let mut followed_pointer = false;
    let mut assembled_len: usize = 0;

    loop {
        let len_byte = *buf
            .get(cursor)
            .ok_or_else(|| malformed("label ran past end of buffer"))?;

        if len_byte == 0 {
            if name_end.is_none() {
                name_end = Some(cursor + 1);
            }
            break;
        }

        if len_byte & 0xC0 == 0xC0 {
            let hi = (len_byte & 0x3F) as usize;
            let lo = *buf
                .get(cursor + 1)
                .ok_or_else(|| malformed("compression pointer truncated"))? as usize;
            let offset = (hi << 8) | lo;

            if offset >= buf.len() {
                return Err(malformed("compression pointer references outside buffer"));
            }
            if followed_pointer {
                return Err(malformed("compression pointer chain too deep"));
            }
            if buf[offset] & 0xC0 == 0xC0 {
                return Err(malformed("compression pointer points at another pointer"));
            }

            if name_end.is_none() {
                name_end = Some(cursor + 2);
            }
            followed_pointer = true;
            cursor = offset;
            continue;
        }

        if len_byte > 63 {
            return Err(malformed(format!("label length {len_byte} exceeds 63")));
        }

        let label_len = len_byte as usize;
        let label_start = cursor + 1;
        let label_end = label_start + label_len;
        if label_end > buf.len() {
            return Err(malformed("label ran past end of buffer"));
        }

        labels.push(buf[label_start..label_end].to_vec());
        assembled_len += label_len + 1;
        if assembled_len > 255 {
            return Err(malformed("assembled QNAME exceeds 255 octets"));
        }

        cursor = label_end;
    }

    Ok((labels, name_end.expect("loop only exits after setting name_end")))
}

fn labels_to_display(labels: &[Vec<u8>]) -> String {
    if labels.is_empty() {
        return ".".to_string();
    }
    let mut out = String::new();
    for label in labels {
        out.push_str(&String::from_utf8_lossy(label));
        out.push('.');
    }
    out
}

/// Parses a client query per spec.md §4.1.
pub fn parse_query(buf: &[u8]) -> Result<ParsedQuery, DnsProxyError> {
    if buf.len() < 17 {
        return Err(malformed(format!(
            "query too short: {} bytes, need at least 17",
            buf.len()
        )));
    }

    let header_bytes: [u8; 12] = buf[0..12].try_into().expect("checked length above");
    let header = Header::unpack(&header_bytes)?;

    if header.qdcount != 1 {
        return Err(malformed(format!(
            "qdcount was {}, expected 1",
            header.qdcount
        )));
    }

    let (qname_labels, name_end) = read_qname(buf, 12)?;
    let qname = labels_to_display(&qname_labels);

    let qtype_end = name_end + 2;
    let qclass_end = name_end + 4;
    if buf.len() < qclass_end {
        return Err(malformed("buffer too short for QTYPE/QCLASS"));
    }

    let qtype = RecordType::from(u16::from_be_bytes([buf[name_end], buf[name_end + 1]]));
    let qclass = RecordClass::from(u16::from_be_bytes([buf[qtype_end], buf[qtype_end + 1]]));

    Ok(ParsedQuery {
        header,
        qname,
        qname_labels,
        qtype,
        qclass,
    })
}

/// Tracks `(offset, remaining-labels)` pairs written so far, so later names
/// (or suffixes of names) can be replaced with a 2-byte pointer. This is
/// the encoder half of spec.md §4.1's "Name compression on write".
#[derive(Default)]
struct Compressor {
    offsets: Vec<(u16, Vec<Vec<u8>>)>,
}

impl Compressor {
    fn find(&self, suffix: &[Vec<u8>]) -> Option<u16> {
        self.offsets
            .iter()
            .find(|(_, tail)| tail.as_slice() == suffix)
            .map(|(offset, _)| *offset)
    }

    /// Writes `labels` (root-to-leaf, no trailing empty label) into `out`,
    /// using a pointer wherever a previously-written suffix matches.
    fn write_name(&mut self, out: &mut Vec<u8>, labels: &[Vec<u8>]) -> Result<(), DnsProxyError> {
        let mut idx = 0;
        loop {
            let suffix = &labels[idx..];
            if suffix.is_empty() {
                out.push(0);
                return Ok(());
            }

            if let Some(offset) = self.find(suffix) {
                let pointer = 0xC000u16 | offset;
                out.extend_from_slice(&pointer.to_be_bytes());
                return Ok(());
            }

            let current_offset = out.len();
            if current_offset <= 0x3FFF {
                self.offsets.push((current_offset as u16, suffix.to_vec()));
            }

            let label = &labels[idx];
            if label.len() > 63 {
                return Err(malformed("label longer than 63 octets"));
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label);
            idx += 1;
        }
    }
}

/// Builds a synthetic "blocked" response: same ID/question as the query,
/// `authority=1`, `recursion-available` mirrored from the query's
/// `recursion-desired`, one A answer with TTL 60 pointing at
/// `block_sink_ipv4`. Per spec.md §4.1 "Build operation".
pub fn build_block_reply(query: &ParsedQuery, block_sink_ipv4: std::net::Ipv4Addr) -> Result<Vec<u8>, DnsProxyError> {
    let reply_header = query.header.as_reply(1);

    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&reply_header.pack()?);

    let mut compressor = Compressor::default();
    compressor.write_name(&mut out, &query.qname_labels)?;
    out.extend_from_slice(&u16::from(query.qtype).to_be_bytes());
    out.extend_from_slice(&u16::from(query.qclass).to_be_bytes());

    // Answer section: name (compressed against the question), TYPE=A,
    // CLASS=IN, TTL=60, RDLENGTH=4, RDATA=block_sink_ipv4.
    compressor.write_name(&mut out, &query.qname_labels)?;
    out.extend_from_slice(&u16::from(RecordType::A).to_be_bytes());
    out.extend_from_slice(&u16::from(RecordClass::Internet).to_be_bytes());
    out.extend_from_slice(&60u32.to_be_bytes());
    out.extend_from_slice(&4u16.to_be_bytes());
    out.extend_from_slice(&block_sink_ipv4.octets());

    if out.len() > MAX_PACKET_SIZE {
        return Err(malformed("built reply exceeds maximum packet size"));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_query(qname_labels: &[&str], qtype: u16, qclass: u16, id: u16, rd: bool) -> Vec<u8> {
        let header = Header {
            id,
            qr: false,
            opcode: 0,
            authoritative: false,
            truncated: false,
            recursion_desired: rd,
            recursion_available: false,
            z: false,
            ad: false,
            cd: false,
            rcode: 0,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        };
        let mut buf = header.pack().unwrap().to_vec();
        for label in qname_labels {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&qtype.to_be_bytes());
        buf.extend_from_slice(&qclass.to_be_bytes());
        buf
    }

    #[test]
    fn parses_simple_query() {
        let buf = encode_query(&["www", "example", "com"], 1, 1, 0x1234, true);
        let parsed = parse_query(&buf).unwrap();
        assert_eq!(parsed.header.id, 0x1234);
        assert_eq!(parsed.qname, "www.example.com.");
        assert_eq!(parsed.qtype, RecordType::A);
        assert_eq!(parsed.qclass, RecordClass::Internet);
        assert!(parsed.header.recursion_desired);
    }

    #[test]
    fn parses_root_name() {
        let buf = encode_query(&[], 1, 1, 1, false);
        let parsed = parse_query(&buf).unwrap();
        assert_eq!(parsed.qname, ".");
        assert!(parsed.qname_labels.is_empty());
    }

    #[test]
    fn rejects_too_short() {
        let err = parse_query(&[0u8; 10]);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_qdcount_not_one() {
        let mut buf = encode_query(&["a"], 1, 1, 1, false);
        buf[4] = 0;
        buf[5] = 2;
        assert!(parse_query(&buf).is_err());
    }

    #[test]
    fn rejects_label_too_long() {
        let mut buf = encode_query(&["a"], 1, 1, 1, false);
        buf[12] = 64;
        assert!(parse_query(&buf).is_err());
    }

    #[test]
    fn rejects_label_past_buffer() {
        let mut buf = encode_query(&["a"], 1, 1, 1, false);
        buf.truncate(14); // lop off the end, leaving a dangling label length
        assert!(parse_query(&buf).is_err());
    }

    #[test]
    fn rejects_pointer_outside_buffer() {
        let mut buf = encode_query(&["a"], 1, 1, 1, false);
        buf[12] = 0xC0;
        buf[13] = 0xFF; // points well past the buffer
        assert!(parse_query(&buf).is_err());
    }

    #[test]
    fn rejects_pointer_to_pointer() {
        // Two pointers back to back; the first points at the second.
        let mut buf = encode_query(&["a"], 1, 1, 1, false);
        buf.extend_from_slice(&[0xC0, 0xC0, 0x00]);
        let ptr_offset = buf.len() - 3;
        buf[12] = 0xC0;
        buf[13] = ptr_offset as u8;
        assert!(parse_query(&buf).is_err());
    }

    #[test]
    fn build_reply_round_trips_question() {
        let query_buf = encode_query(&["a", "b", "example", "com"], 1, 1, 0xBEEF, true);
        let query = parse_query(&query_buf).unwrap();
        let reply_buf =
            build_block_reply(&query, std::net::Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        let reply = parse_query(&reply_buf).unwrap();
        assert_eq!(reply.header.id, 0xBEEF);
        assert_eq!(reply.qname, query.qname);
        assert_eq!(reply.qtype, query.qtype);
        assert_eq!(reply.qclass, query.qclass);
    }

    #[test]
    fn build_reply_sets_flags_and_uses_compression() {
        let query_buf = encode_query(&["example", "com"], 1, 1, 7, true);
        let query = parse_query(&query_buf).unwrap();
        let reply_buf =
            build_block_reply(&query, std::net::Ipv4Addr::new(192, 0, 2, 1)).unwrap();
        let reply_header = Header::unpack(&reply_buf[0..12].try_into().unwrap()).unwrap();
        assert!(reply_header.qr);
        assert!(reply_header.authoritative);
        assert!(reply_header.recursion_available);
        assert_eq!(reply_header.ancount, 1);
        // The answer's name should be a pointer back to the question (offset 12 = 0x0c).
        assert!(reply_buf.windows(2).any(|w| w == [0xC0, 0x0C]));
        let rdata = &reply_buf[reply_buf.len() - 4..];
        assert_eq!(rdata, [192, 0, 2, 1]);
    }

    #[test]
    fn build_reply_without_recursion_desired_leaves_ra_unset() {
        let query_buf = encode_query(&["x"], 1, 1, 1, false);
        let query = parse_query(&query_buf).unwrap();
        let reply_buf =
            build_block_reply(&query, std::net::Ipv4Addr::new(0, 0, 0, 0)).unwrap();
        let reply_header = Header::unpack(&reply_buf[0..12].try_into().unwrap()).unwrap();
        assert!(!reply_header.recursion_available);
    }
}
