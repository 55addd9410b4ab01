//! Decoding of raw row tokens into typed values.
//!
//! MonetDB sends every value as text. The declared column type from the
//! `% ... # type` header decides how a token is interpreted.

use monetdb_core::error::TypeError;
use monetdb_core::{Error, Result, Value};

/// Is this raw token SQL NULL? Only the unquoted forms count.
pub fn is_null_token(token: &str) -> bool {
    token == "NULL" || token == "null"
}

/// Decode one raw token according to its column's declared type.
///
/// The row lexer only admits bare integers, decimals and `YYYY-MM-DD[ HH:MM:SS[.f]]`
/// literals, so `time`, `timetz`, `timestamptz`, `blob` and `uuid` values
/// reach these decoders only as quoted tokens. The server sends them bare,
/// and such rows fail in the lexer before decoding.
pub fn decode_token(type_name: &str, token: &str) -> Result<Value> {
    if is_null_token(token) {
        return Ok(Value::Null);
    }

    let value = match type_name.to_ascii_lowercase().as_str() {
        "boolean" | "bool" => match token {
            "true" | "TRUE" => Value::Bool(true),
            "false" | "FALSE" => Value::Bool(false),
            _ => return Err(type_error("boolean", token)),
        },
        "tinyint" => Value::TinyInt(parse_number("tinyint", token)?),
        "smallint" => Value::SmallInt(parse_number("smallint", token)?),
        "int" | "integer" | "mediumint" => Value::Int(parse_number("int", token)?),
        "bigint" | "serial" | "bigserial" | "wrd" | "lng" => {
            Value::BigInt(parse_number("bigint", token)?)
        }
        "oid" => {
            // OIDs print as `<n>@0`.
            let digits = token.split_once('@').map_or(token, |(n, _)| n);
            Value::from_u64_clamped(parse_number("oid", digits)?)
        }
        "hugeint" | "decimal" | "numeric" | "sec_interval" | "day_interval" => {
            Value::Decimal(token.to_string())
        }
        "month_interval" => Value::Int(parse_number("month_interval", token)?),
        "real" => Value::Float(parse_number("real", token)?),
        "double" | "float" => Value::Double(parse_number("double", token)?),
        "date" => Value::Date(parse_date(unquote(token))?),
        "time" | "timetz" => Value::Time(parse_time(unquote(token))?),
        "timestamp" => Value::Timestamp(parse_timestamp(unquote(token))?),
        "timestamptz" => Value::TimestampTz(parse_timestamptz(unquote(token))?),
        "blob" => Value::Bytes(decode_hex(unquote(token))?),
        "uuid" => Value::Uuid(parse_uuid(unquote(token))?),
        "json" => {
            let text = unescape_string(token)?;
            Value::Json(
                serde_json::from_str(&text).map_err(|e| type_error_with_source("json", &text, e))?,
            )
        }
        _ => Value::Text(unescape_string(token)?),
    };
    Ok(value)
}

/// Strip the outer quotes of a string token and decode its escapes.
///
/// Unquoted tokens are returned unchanged.
pub fn unescape_string(token: &str) -> Result<String> {
    let Some(inner) = token
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    else {
        return Ok(token.to_string());
    };

    let mut bytes = Vec::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut utf8 = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => bytes.push(b'\n'),
            Some('t') => bytes.push(b'\t'),
            Some('r') => bytes.push(b'\r'),
            Some('f') => bytes.push(0x0C),
            Some('b') => bytes.push(0x08),
            Some(d @ '0'..='7') => {
                // Three-digit octal escape.
                let octal: String = std::iter::once(d).chain(chars.by_ref().take(2)).collect();
                let byte =
                    u8::from_str_radix(&octal, 8).map_err(|_| type_error("octal escape", token))?;
                bytes.push(byte);
            }
            Some(other) => {
                let mut utf8 = [0u8; 4];
                bytes.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes());
            }
            None => bytes.push(b'\\'),
        }
    }
    String::from_utf8(bytes).map_err(|e| type_error_with_source("UTF-8 string", token, e))
}

fn unquote(token: &str) -> &str {
    token
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(token)
}

fn parse_number<T>(expected: &'static str, token: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error,
{
    token
        .parse()
        .map_err(|e| type_error_with_source(expected, token, e))
}

/// Parse `YYYY-MM-DD` into days since the Unix epoch.
pub fn parse_date(s: &str) -> Result<i32> {
    let mut parts = s.splitn(3, '-');
    let (Some(year), Some(month), Some(day)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(type_error("date", s));
    };
    let year: i32 = year.parse().map_err(|_| type_error("date", s))?;
    let month: u32 = month.parse().map_err(|_| type_error("date", s))?;
    let day: u32 = day.parse().map_err(|_| type_error("date", s))?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(type_error("date", s));
    }
    Ok(date_to_days(year, month, day))
}

/// Parse `HH:MM:SS[.ffffff]` into microseconds since midnight.
pub fn parse_time(s: &str) -> Result<i64> {
    let (clock, fraction) = match s.split_once('.') {
        Some((clock, fraction)) => (clock, Some(fraction)),
        None => (s, None),
    };

    let fields: Vec<i64> = clock
        .split(':')
        .map(|f| f.parse().map_err(|_| type_error("time", s)))
        .collect::<Result<_>>()?;
    let [hours, minutes, seconds] = fields[..] else {
        return Err(type_error("time", s));
    };
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) || !(0..61).contains(&seconds) {
        return Err(type_error("time", s));
    }

    let mut micros = (hours * 3600 + minutes * 60 + seconds) * 1_000_000;
    if let Some(fraction) = fraction {
        if fraction.is_empty() || !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(type_error("time", s));
        }
        let digits = &fraction[..fraction.len().min(6)];
        let value: i64 = digits.parse().map_err(|_| type_error("time", s))?;
        micros += value * 10_i64.pow(6 - digits.len() as u32);
    }
    Ok(micros)
}

/// Parse `YYYY-MM-DD[ HH:MM:SS[.ffffff]]` into microseconds since the epoch.
pub fn parse_timestamp(s: &str) -> Result<i64> {
    let (date, time) = match s.split_once([' ', 'T']) {
        Some((date, time)) => (date, parse_time(time)?),
        None => (s, 0),
    };
    Ok(i64::from(parse_date(date)?) * 86_400 * 1_000_000 + time)
}

/// Parse a timestamp with a trailing `+HH:MM`/`-HH:MM` offset, normalized to UTC.
pub fn parse_timestamptz(s: &str) -> Result<i64> {
    // The offset sign can only appear after the date part.
    let split = s
        .char_indices()
        .skip(10)
        .find(|&(_, c)| c == '+' || c == '-')
        .map(|(i, _)| i);
    let Some(at) = split else {
        return parse_timestamp(s);
    };

    let local = parse_timestamp(&s[..at])?;
    let sign = if s[at..].starts_with('-') { -1 } else { 1 };
    let (hours, minutes) = s[at + 1..].split_once(':').unwrap_or((&s[at + 1..], "0"));
    let hours: i64 = hours.parse().map_err(|_| type_error("timestamptz", s))?;
    let minutes: i64 = minutes.parse().map_err(|_| type_error("timestamptz", s))?;
    Ok(local - sign * (hours * 3600 + minutes * 60) * 1_000_000)
}

fn parse_uuid(s: &str) -> Result<[u8; 16]> {
    let hex: String = s.chars().filter(|&c| c != '-').collect();
    if hex.len() != 32 || !hex.is_ascii() {
        return Err(type_error("uuid", s));
    }
    let mut bytes = [0u8; 16];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| type_error("uuid", s))?;
    }
    Ok(bytes)
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return Err(type_error("blob hex", s));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| type_error("blob hex", s)))
        .collect()
}

/// Convert year/month/day to days since Unix epoch.
fn date_to_days(year: i32, month: u32, day: u32) -> i32 {
    // Algorithm from https://howardhinnant.github.io/date_algorithms.html
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u32;
    let doy = (153 * (if month > 2 { month - 3 } else { month + 9 }) + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i32 - 719_468
}

fn type_error(expected: &'static str, value: impl std::fmt::Display) -> Error {
    Error::Type(TypeError {
        expected,
        actual: format!("invalid value: {}", value),
        column: None,
    })
}

fn type_error_with_source<E: std::error::Error>(
    expected: &'static str,
    value: impl std::fmt::Display,
    source: E,
) -> Error {
    Error::Type(TypeError {
        expected,
        actual: format!("invalid value: {} ({})", value, source),
        column: None,
    })
}
