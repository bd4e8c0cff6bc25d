//! Human readable durations for the report.

pub const USEC_PER_MSEC: u64 = 1_000;
pub const USEC_PER_SEC: u64 = 1_000_000;
pub const USEC_PER_MINUTE: u64 = 60 * USEC_PER_SEC;
pub const USEC_PER_HOUR: u64 = 60 * USEC_PER_MINUTE;
pub const USEC_PER_DAY: u64 = 24 * USEC_PER_HOUR;
pub const USEC_PER_WEEK: u64 = 7 * USEC_PER_DAY;
pub const USEC_PER_MONTH: u64 = 2_629_800 * USEC_PER_SEC;
pub const USEC_PER_YEAR: u64 = 31_557_600 * USEC_PER_SEC;

const UNITS: [(&str, u64); 9] = [
    ("y", USEC_PER_YEAR),
    ("month", USEC_PER_MONTH),
    ("w", USEC_PER_WEEK),
    ("d", USEC_PER_DAY),
    ("h", USEC_PER_HOUR),
    ("min", USEC_PER_MINUTE),
    ("s", USEC_PER_SEC),
    ("ms", USEC_PER_MSEC),
    ("us", 1),
];

fn decimal_digits(mut value: u64) -> usize {
    let mut digits = 0;
    while value > 0 {
        value /= 10;
        digits += 1;
    }
    digits
}

/// Milliseconds with `significant` digits, padded so the unit lines up in a
/// nine column field: `"  9.00 ms"`, `" 0.500 ms"`, `"123    ms"`.
pub fn format_ms(usec: u64, significant: usize) -> String {
    let prec = significant - decimal_digits(usec / USEC_PER_MSEC).min(significant);
    let value_width = if prec == 0 { 3 } else { (4 + prec).min(6) };
    let unit_width = 9 - value_width;
    format!(
        "{:>vw$.p$}{:>uw$}",
        usec as f64 / USEC_PER_MSEC as f64,
        "ms",
        vw = value_width,
        p = prec,
        uw = unit_width
    )
}

/// Pick the largest unit not above `usec` and print the value in it, e.g.
/// `"14 ms"`, `"2.5 s"` (with `significant` = 2).
pub fn format_timespan(usec: u64, significant: usize) -> String {
    let last = UNITS.len() - 1;
    let idx = UNITS[..last]
        .iter()
        .position(|&(_, unit)| usec >= unit)
        .unwrap_or(last);
    let (suffix, unit) = UNITS[idx];
    let prec = if idx == last {
        0
    } else {
        significant - decimal_digits(usec / unit).min(significant)
    };
    format!("{:.*} {}", prec, usec as f64 / unit as f64, suffix)
}
