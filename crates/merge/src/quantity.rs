//! Formatted CPU/memory quantity codec for overview aggregation.
//!
//! Sums happen on raw milli-CPU and bytes; formatting stays within the
//! values the parser accepts, so merged results re-parse exactly.

use argus_core::{Error, Result};

/// Parses a CPU quantity into millicores. Accepts nanocores (`n`),
/// microcores (`u`), millicores (`m`) and bare cores, with decimals.
/// An empty string counts as zero (metrics absent).
pub fn parse_cpu(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    let (number, scale_num, scale_den) = if let Some(v) = s.strip_suffix('n') {
        (v, 1u64, 1_000_000u64)
    } else if let Some(v) = s.strip_suffix('u') {
        (v, 1, 1_000)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 1, 1)
    } else {
        (s, 1_000, 1)
    };
    scaled(number, scale_num, scale_den)
        .ok_or_else(|| Error::Merge(format!("invalid cpu quantity {s:?}")))
}

/// Millicores back to the canonical string: whole cores render bare
/// (`"2"`), anything else in millicores (`"250m"`).
pub fn format_cpu(millis: u64) -> String {
    if millis % 1_000 == 0 {
        (millis / 1_000).to_string()
    } else {
        format!("{millis}m")
    }
}

const BINARY_UNITS: [(&str, u64); 6] = [
    ("Ei", 1 << 60),
    ("Pi", 1 << 50),
    ("Ti", 1 << 40),
    ("Gi", 1 << 30),
    ("Mi", 1 << 20),
    ("Ki", 1 << 10),
];

/// Parses a memory quantity into bytes. Accepts the binary suffixes
/// (`Ki`..`Ei`), decimal `K`/`M`/`G`/`T`, and bare bytes, with
/// decimals. An empty string counts as zero.
pub fn parse_memory(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    for (unit, factor) in BINARY_UNITS {
        if let Some(v) = s.strip_suffix(unit) {
            return scaled(v, factor, 1)
                .ok_or_else(|| Error::Merge(format!("invalid memory quantity {s:?}")));
        }
    }
    for (unit, factor) in [("K", 1_000u64), ("M", 1_000_000), ("G", 1_000_000_000), ("T", 1_000_000_000_000)] {
        if let Some(v) = s.strip_suffix(unit) {
            return scaled(v, factor, 1)
                .ok_or_else(|| Error::Merge(format!("invalid memory quantity {s:?}")));
        }
    }
    scaled(s, 1, 1).ok_or_else(|| Error::Merge(format!("invalid memory quantity {s:?}")))
}

/// Bytes back to the largest binary unit that divides exactly, falling
/// back to bare bytes. `1.5Gi` therefore renders as `1536Mi`.
pub fn format_memory(bytes: u64) -> String {
    for (unit, factor) in BINARY_UNITS {
        if bytes != 0 && bytes % factor == 0 {
            return format!("{}{unit}", bytes / factor);
        }
    }
    bytes.to_string()
}

/// `value * num / den`, exact for integer input, rounded via f64 for
/// decimal input. None on malformed or negative input.
fn scaled(value: &str, num: u64, den: u64) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(whole) = value.parse::<u64>() {
        // Round half away from zero, like the decimal path below.
        let scaled = whole.checked_mul(num)?;
        return Some(scaled.checked_add(den / 2)? / den);
    }
    let f: f64 = value.parse().ok()?;
    if !f.is_finite() || f < 0.0 {
        return None;
    }
    Some((f * num as f64 / den as f64).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_parses_all_accepted_forms() {
        assert_eq!(parse_cpu("").unwrap(), 0);
        assert_eq!(parse_cpu("250m").unwrap(), 250);
        assert_eq!(parse_cpu("2").unwrap(), 2_000);
        assert_eq!(parse_cpu("1.5").unwrap(), 1_500);
        assert_eq!(parse_cpu("1500000n").unwrap(), 2, "nanocores round to millis");
        assert_eq!(parse_cpu("2000u").unwrap(), 2);
        assert!(parse_cpu("lots").is_err());
        assert!(parse_cpu("-1").is_err());
    }

    #[test]
    fn cpu_formats_whole_cores_bare() {
        assert_eq!(format_cpu(2_000), "2");
        assert_eq!(format_cpu(250), "250m");
        assert_eq!(format_cpu(0), "0");
        assert_eq!(format_cpu(1_250), "1250m");
    }

    #[test]
    fn cpu_sum_round_trips() {
        let total = parse_cpu("150m").unwrap() + parse_cpu("100m").unwrap();
        assert_eq!(format_cpu(total), "250m");
        assert_eq!(parse_cpu(&format_cpu(total)).unwrap(), total);
    }

    #[test]
    fn memory_parses_binary_decimal_and_bare() {
        assert_eq!(parse_memory("").unwrap(), 0);
        assert_eq!(parse_memory("512Mi").unwrap(), 512 << 20);
        assert_eq!(parse_memory("1.5Gi").unwrap(), 1536 << 20);
        assert_eq!(parse_memory("1K").unwrap(), 1_000);
        assert_eq!(parse_memory("4096").unwrap(), 4_096);
        assert!(parse_memory("plenty").is_err());
    }

    #[test]
    fn memory_formats_with_largest_exact_unit() {
        assert_eq!(format_memory(1 << 30), "1Gi");
        assert_eq!(format_memory((1 << 30) + (512 << 20)), "1536Mi");
        assert_eq!(format_memory(0), "0");
        assert_eq!(format_memory(1_000), "1000");
    }

    #[test]
    fn memory_sum_round_trips() {
        let total = parse_memory("1Gi").unwrap() + parse_memory("512Mi").unwrap();
        assert_eq!(format_memory(total), "1536Mi");
        assert_eq!(parse_memory(&format_memory(total)).unwrap(), total);
    }
}
