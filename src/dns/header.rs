//! The 12-byte DNS message header, RFC 1035 §4.1.1.

use packed_struct::prelude::*;

/// The header of a DNS transmission, either a query or a reply.
#[derive(Debug, PackedStruct, PartialEq, Eq, Clone, Copy)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "12")]
pub struct Header {
    /// The query ID, copied verbatim between query and reply on the wire
    /// (though the reply actually sent upstream carries `slot`, not this
    /// value — see `table.rs`).
    #[packed_field(bits = "0..=15", endian = "msb")]
    pub id: u16,
    /// False for a query, true for a response.
    #[packed_field(bits = "16")]
    pub qr: bool,
    #[packed_field(bits = "17..=20", endian = "msb")]
    pub opcode: u8,
    #[packed_field(bits = "21")]
    pub authoritative: bool,
    #[packed_field(bits = "22")]
    pub truncated: bool,
    /// RD — set in a query, copied into the response.
    #[packed_field(bits = "23")]
    pub recursion_desired: bool,
    #[packed_field(bits = "24")]
    pub recursion_available: bool,
    #[packed_field(bits = "25")]
    pub z: bool,
    #[packed_field(bits = "26")]
    pub ad: bool,
    #[packed_field(bits = "27")]
    pub cd: bool,
    #[packed_field(bits = "28..=31", endian = "msb")]
    pub rcode: u8,
    #[packed_field(bits = "32..=47", endian = "msb")]
    pub qdcount: u16,
    #[packed_field(bits = "48..=63", endian = "msb")]
    pub ancount: u16,
    #[packed_field(bits = "64..=79", endian = "msb")]
    pub nscount: u16,
    #[packed_field(bits = "80..=95", endian = "msb")]
    pub arcount: u16,
}

impl Header {
    /// Builds the header for a block/upstream reply that mirrors `self`
    /// (the query header), per spec.md §4.1 "Build operation".
    pub fn as_reply(self, ancount: u16) -> Header {
        Header {
            qr: true,
            authoritative: true,
            recursion_available: self.recursion_desired,
            qdcount: 1,
            ancount,
            nscount: 0,
            arcount: 0,
            ..self
        }
    }
}
