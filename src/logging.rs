//! Structured logging setup, adapted from the teacher's `logging.rs`
//! (`tracing-subscriber` + `EnvFilter`) with the OTEL export layer dropped —
//! this system has no collector to send to — and a hex-dump helper for the
//! `-VCB`/`-VSB`/`-VDB` binary logging switches from spec.md §6.4.

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. `debug` raises the default
/// level the way `-D` raises `g_debug` in the original.
pub fn init(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Renders `data` as a `Logger::LogBinary`-style hex dump: offset, 16 bytes
/// in hex, then their printable ASCII rendering.
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(16).enumerate() {
        let hex_bytes: Vec<String> = chunk.iter().map(|b| hex::encode([*b])).collect();
        let hex = hex_bytes.join(" ");
        let ascii: String = chunk
            .iter()
            .map(|byte| if byte.is_ascii_graphic() || *byte == b' ' { *byte as char } else { '.' })
            .collect();
        out.push_str(&format!("{:04x}  {:<48}  {}\n", row * 16, hex, ascii));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hexdump_renders_printable_ascii() {
        let dump = hexdump(b"hello");
        assert!(dump.contains("68 65 6c 6c 6f"));
        assert!(dump.contains("hello"));
    }

    #[test]
    fn hexdump_escapes_non_printable_bytes() {
        let dump = hexdump(&[0x00, 0x01, 0xff]);
        assert!(dump.contains("..."));
    }
}
