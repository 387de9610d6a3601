//! The DNS wire codec (component C1): parsing inbound queries and building
//! outbound replies against RFC 1035, IN class, type-A focus.

pub mod header;
pub mod message;

pub use header::Header;
pub use message::{build_block_reply, parse_query, ParsedQuery, MAX_PACKET_SIZE};
