//! Byte-size constants and a human-readable formatter for memory logs

pub const KIBIBYTE: u64 = 1024;
pub const MEBIBYTE: u64 = 1024 * KIBIBYTE;
pub const GIBIBYTE: u64 = 1024 * MEBIBYTE;

/// Format a byte count with binary units, e.g. `"7.5 GiB"`.
pub fn human_bytes(bytes: u64) -> String {
    let b = bytes as f64;
    if bytes >= GIBIBYTE {
        format!("{:.1} GiB", b / GIBIBYTE as f64)
    } else if bytes >= MEBIBYTE {
        format!("{:.1} MiB", b / MEBIBYTE as f64)
    } else if bytes >= KIBIBYTE {
        format!("{:.1} KiB", b / KIBIBYTE as f64)
    } else {
        format!("{bytes} B")
    }
}
