//! Request grammar.
//!
//! ```text
//! request := "S"
//!          | "R" class mask option* range
//!          | "M" mask
//! class   := "F" | "D" | "DD"
//! option  := "T" | "Z" | "A" | "G"
//! range   := "S" seconds "E" "S" seconds
//!          | "S" seconds "N" count
//! seconds := digits ["." digits]          (seconds since epoch)
//! ```
//!
//! The mask uses the filter-mask grammar; in the list form it ends at
//! the first character that cannot extend it, in the raw form it has a
//! fixed width, so no separator is needed before the options.

use fa_core::{FaError, FilterMask, Result, MICROS_PER_SEC};
use fa_storage::reader::{DataClass, EndSpec, ReadFlags, ReadRequest};

/// A parsed client request.
#[derive(Debug)]
pub enum Request {
    ServerInfo,
    Read(ReadRequest),
    MaskUpdate(FilterMask),
}

/// Parse one request line (without the trailing newline).
pub fn parse_request(line: &str, entry_count: usize) -> Result<Request> {
    let mut rest = line.trim_end_matches(['\r', '\n']);
    match rest.as_bytes().first() {
        Some(b'S') if rest.len() == 1 => Ok(Request::ServerInfo),
        Some(b'R') => {
            rest = &rest[1..];
            let class = parse_class(&mut rest)?;
            let (mask, used) = FilterMask::parse_prefix(rest, entry_count)?;
            rest = &rest[used..];
            let (flags, start_us, end) = parse_options(&mut rest)?;
            if !rest.is_empty() {
                return Err(FaError::protocol(format!(
                    "Unexpected characters at \"{rest}\""
                )));
            }
            Ok(Request::Read(ReadRequest {
                class,
                mask,
                start_us,
                end,
                flags,
            }))
        }
        Some(b'M') => {
            let mask = FilterMask::parse(&rest[1..], entry_count)
                .map_err(|e| FaError::protocol(e.to_string()))?;
            Ok(Request::MaskUpdate(mask))
        }
        _ => Err(FaError::protocol("Unrecognised request")),
    }
}

fn parse_class(rest: &mut &str) -> Result<DataClass> {
    match rest.as_bytes() {
        [b'D', b'D', ..] => {
            *rest = &rest[2..];
            Ok(DataClass::DoubleDec)
        }
        [b'D', ..] => {
            *rest = &rest[1..];
            Ok(DataClass::Dec)
        }
        [b'F', ..] => {
            *rest = &rest[1..];
            Ok(DataClass::Fa)
        }
        _ => Err(FaError::protocol("Unknown data class")),
    }
}

fn parse_options(rest: &mut &str) -> Result<(ReadFlags, u64, EndSpec)> {
    let mut flags = ReadFlags::default();
    let mut range: Option<(u64, EndSpec)> = None;
    loop {
        match rest.as_bytes().first() {
            Some(b'T') => {
                flags.send_timestamp = true;
                *rest = &rest[1..];
            }
            Some(b'Z') => {
                flags.send_sample_count = true;
                *rest = &rest[1..];
            }
            Some(b'A') => {
                flags.all_data = true;
                *rest = &rest[1..];
            }
            Some(b'G') => {
                flags.check_id0 = true;
                *rest = &rest[1..];
            }
            Some(b'S') if range.is_none() => {
                *rest = &rest[1..];
                let start = parse_seconds(rest)?;
                match rest.as_bytes().first() {
                    Some(b'E') => {
                        if rest.as_bytes().get(1) != Some(&b'S') {
                            return Err(FaError::protocol("Malformed time range"));
                        }
                        *rest = &rest[2..];
                        let end = parse_seconds(rest)?;
                        range = Some((start, EndSpec::Time(end)));
                    }
                    Some(b'N') => {
                        *rest = &rest[1..];
                        let count = parse_count(rest)?;
                        range = Some((start, EndSpec::Samples(count)));
                    }
                    _ => return Err(FaError::protocol("Malformed time range")),
                }
            }
            _ => break,
        }
    }
    match range {
        Some((start, end)) => Ok((flags, start, end)),
        None => Err(FaError::protocol("Missing time range")),
    }
}

/// Decimal seconds with an optional fraction, returned in µs.
fn parse_seconds(rest: &mut &str) -> Result<u64> {
    let whole = parse_count(rest)?;
    let mut micros = whole
        .checked_mul(MICROS_PER_SEC)
        .ok_or_else(|| FaError::protocol("Timestamp out of range"))?;
    if rest.as_bytes().first() == Some(&b'.') {
        *rest = &rest[1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return Err(FaError::protocol("Malformed timestamp"));
        }
        let mut fraction = 0u64;
        for (i, b) in rest.bytes().take(digits.min(6)).enumerate() {
            fraction += u64::from(b - b'0') * 10u64.pow(5 - i as u32);
        }
        micros += fraction;
        *rest = &rest[digits..];
    }
    Ok(micros)
}

fn parse_count(rest: &mut &str) -> Result<u64> {
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return Err(FaError::protocol(format!(
            "Number missing at \"{rest}\""
        )));
    }
    let value = rest[..digits]
        .parse::<u64>()
        .map_err(|_| FaError::protocol("Number out of range"))?;
    *rest = &rest[digits..];
    Ok(value)
}
