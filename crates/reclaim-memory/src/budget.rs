use crate::error::MemoryError;

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;

/// Parse a human-friendly byte size such as `512`, `64KiB`, `256MB` or `1.5G`.
///
/// Suffixes are case-insensitive and always binary (`1K == 1024`). A bare
/// number is a byte count.
pub fn parse_byte_size(input: &str) -> Result<u64, MemoryError> {
    let invalid = |reason: &str| MemoryError::InvalidByteSize {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty value"));
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(invalid("missing numeric value"));
    }

    let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KB,
        "m" | "mb" | "mib" => MB,
        "g" | "gb" | "gib" => GB,
        "t" | "tb" | "tib" => GB * 1024,
        _ => return Err(invalid("unknown unit suffix")),
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| invalid("value overflows u64"));
    }

    let fractional = number
        .parse::<f64>()
        .map_err(|_| invalid("not a number"))?;
    let bytes = fractional * multiplier as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(invalid("value overflows u64"));
    }
    Ok(bytes.round() as u64)
}

/// Render a byte count with a binary unit, for logs and CLI output.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GB {
        format!("{:.2} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
