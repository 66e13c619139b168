//! Shared CLI argument parsers.

/// Parse a memory size in MiB. Accepts a bare number of MiB or a `M`/`G`
/// suffix (e.g. "2048", "512M", "4G").
pub fn parse_memory(s: &str) -> Result<u64, String> {
    let raw = s.trim();
    let (digits, factor) = match raw.char_indices().last() {
        Some((i, 'G' | 'g')) => (&raw[..i], 1024),
        Some((i, 'M' | 'm')) => (&raw[..i], 1),
        _ => (raw, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid memory size: {}", s))?;
    if value == 0 {
        return Err("memory size must be greater than zero".to_string());
    }
    value
        .checked_mul(factor)
        .ok_or_else(|| format!("memory size too large: {}", s))
}

/// Parse a non-zero count, used for CPUs and disk sizes in GiB.
pub fn parse_positive(s: &str) -> Result<u64, String> {
    match s.trim().parse::<u64>() {
        Ok(0) => Err("value must be greater than zero".to_string()),
        Ok(n) => Ok(n),
        Err(_) => Err(format!("invalid number: {}", s)),
    }
}

/// Whether a prompt answer accepts.
pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
