//! Text helpers shared by attributes, fields and tree rendering.

use std::cmp::Ordering;

/// Decode bytes with `encoding`, falling back to latin-1 (or utf-8 when the
/// configured encoding is not utf-8). NUL characters are removed and trailing
/// whitespace trimmed.
pub fn decode(bytes: &[u8], encoding: &str) -> String {
    let is_utf8 = matches!(encoding.to_ascii_lowercase().as_str(), "utf-8" | "utf8");
    let decoded = if is_utf8 {
        match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            Err(_) => latin1(bytes),
        }
    } else if matches!(encoding.to_ascii_lowercase().as_str(), "latin-1" | "latin1" | "iso-8859-1") {
        latin1(bytes)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };
    clean(&decoded)
}

/// Strip NUL characters and trailing whitespace.
pub fn clean(s: &str) -> String {
    s.replace('\0', "").trim_end().to_string()
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Format a float with six significant digits and a compact exponent
/// (`1e+05` becomes `1e5`, `2.5e-07` becomes `2.5e-7`).
pub fn format_float(value: f64) -> String {
    format_float_width(value, 6)
}

pub fn format_float_width(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".into();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if value == 0.0 {
        return "0".into();
    }
    let precision = precision.max(1);
    let exponent = value.abs().log10().floor() as i32;
    if exponent < -4 || exponent >= precision as i32 {
        let mantissa = format!("{:.*e}", precision - 1, value);
        match mantissa.split_once('e') {
            Some((m, e)) => format!("{}e{}", trim_zeros(m), e.trim_start_matches('+')),
            None => mantissa,
        }
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim_zeros(&format!("{value:.decimals$}")).to_string()
    }
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// Split an `axes` attribute into names. Names may be separated by
/// commas, colons, semicolons or spaces and wrapped in brackets.
pub fn read_axes(axes: &str) -> Vec<String> {
    let stripped: String = axes
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | '(' | ')' | '\'' | '"'))
        .collect();
    stripped
        .split(|c: char| matches!(c, ',' | ':' | ';' | ' '))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Natural ordering: `label_9` sorts before `label_10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut ai, mut bi) = (a.chars().peekable(), b.chars().peekable());
    loop {
        match (ai.peek().copied(), bi.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let na = take_number(&mut ai);
                let nb = take_number(&mut bi);
                match na.cmp(&nb) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            (Some(x), Some(y)) => {
                let ord = x.to_ascii_lowercase().cmp(&y.to_ascii_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                ai.next();
                bi.next();
            }
        }
    }
}

fn take_number(it: &mut std::iter::Peekable<std::str::Chars<'_>>) -> u128 {
    let mut n: u128 = 0;
    while let Some(c) = it.peek().copied() {
        match c.to_digit(10) {
            Some(d) => {
                n = n.saturating_mul(10).saturating_add(d as u128);
                it.next();
            }
            None => break,
        }
    }
    n
}

/// Human readable byte count (`1.5MB`).
pub fn human_size(bytes: usize) -> String {
    const UNITS: [&str; 8] = ["B", "kB", "MB", "GB", "TB", "PB", "EB", "ZB"];
    if bytes == 0 {
        return "0.0B".into();
    }
    let magnitude = ((bytes as f64).log(1000.0).floor() as usize).min(UNITS.len() - 1);
    let value = bytes as f64 / 1000f64.powi(magnitude as i32);
    format!("{value:3.1}{}", UNITS[magnitude])
}
