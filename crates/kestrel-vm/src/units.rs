//! Parsing of human-readable byte sizes such as `1GB` or `512MiB`.

use crate::error::{Result, VmError};

/// Parse a byte size string into a number of bytes.
///
/// Decimal (`kB`, `MB`, `GB`, `TB`, `PB`, `EB`) and binary (`KiB` .. `EiB`)
/// suffixes are accepted, as are a bare number, `B` and ` bytes`.
/// An empty string parses as zero.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    if input.is_empty() {
        return Ok(0);
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, suffix) = input.split_at(split);

    if digits.is_empty() {
        return Err(VmError::Config(format!("invalid byte size: {input}")));
    }

    let value: u64 = digits
        .parse()
        .map_err(|_| VmError::Config(format!("invalid integer in byte size: {input}")))?;

    let multiplier: u64 = match suffix {
        "" | "B" | " bytes" => 1,
        "kB" => 1000,
        "MB" => 1000u64.pow(2),
        "GB" => 1000u64.pow(3),
        "TB" => 1000u64.pow(4),
        "PB" => 1000u64.pow(5),
        "EB" => 1000u64.pow(6),
        "KiB" => 1024,
        "MiB" => 1024u64.pow(2),
        "GiB" => 1024u64.pow(3),
        "TiB" => 1024u64.pow(4),
        "PiB" => 1024u64.pow(5),
        "EiB" => 1024u64.pow(6),
        _ => return Err(VmError::Config(format!("invalid byte size suffix: {input}"))),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| VmError::Config(format!("byte size overflows: {input}")))
}

/// Parse a CPU count. Must be a positive integer.
pub fn parse_cpu_count(input: &str) -> Result<u32> {
    match input.trim().parse::<u32>() {
        Ok(0) | Err(_) => Err(VmError::Config(format!("invalid CPU count: {input}"))),
        Ok(n) => Ok(n),
    }
}
