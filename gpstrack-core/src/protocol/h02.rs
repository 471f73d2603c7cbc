//! H02 trackers: `*XX,id,CMD,...#` text sentences and `$`-prefixed BCD binary reports.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::fix::Fix;
use crate::imei::{bcd_integer, from_short_id, hex_digits};

use super::{
    ascii_number, malformed, utc_timestamp, Context, Decoded, Event, FrameDecodeError,
};

const TEXT_START: u8 = b'*';
const TEXT_END: u8 = b'#';
const BINARY_START: u8 = b'$';
const BINARY_SHORT: usize = 32;
const BINARY_LONG: usize = 42;
const SHORT_ID_LEN: usize = 10;

pub fn decode_frame(buf: &[u8], ctx: &Context) -> Result<Decoded, FrameDecodeError> {
    let skip = buf
        .iter()
        .take_while(|b| matches!(b, b'\r' | b'\n' | b' '))
        .count();
    let rest = &buf[skip..];
    let Some(&start) = rest.first() else {
        if skip > 0 {
            return Ok(Decoded::new(skip, Vec::new()));
        }
        return Err(FrameDecodeError::NeedMore);
    };
    match start {
        TEXT_START => {
            let end = rest
                .iter()
                .position(|&b| b == TEXT_END)
                .ok_or(FrameDecodeError::NeedMore)?;
            let sentence = String::from_utf8_lossy(&rest[..=end]);
            let events = decode_text(sentence.trim(), ctx)?;
            Ok(Decoded::new(skip + end + 1, events))
        }
        BINARY_START => {
            let len = binary_len(rest)?;
            let events = decode_binary(&rest[..len])?;
            Ok(Decoded::new(skip + len, events))
        }
        other => Err(FrameDecodeError::BadStart(other)),
    }
}

/// Binary reports carry no length. A report ends where the buffer or the next report starts;
/// the long form is tried first.
fn binary_len(rest: &[u8]) -> Result<usize, FrameDecodeError> {
    let boundary = |at: usize| {
        rest.get(at)
            .map_or(at == rest.len(), |b| matches!(b, b'$' | b'*' | b'\r' | b'\n'))
    };
    if rest.len() < BINARY_SHORT {
        return Err(FrameDecodeError::NeedMore);
    }
    if rest.len() >= BINARY_LONG && boundary(BINARY_LONG) {
        return Ok(BINARY_LONG);
    }
    if boundary(BINARY_SHORT) {
        return Ok(BINARY_SHORT);
    }
    if rest.len() < BINARY_LONG {
        return Err(FrameDecodeError::NeedMore);
    }
    Err(malformed("binary report of unknown length"))
}

fn latlon_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [r"^-(\d+)-(\d+\.\d+)", r"^(\d+)(\d\d\.\d+)", r"^(\d+)(\d\d)(\d{4})"]
            .map(|p| Regex::new(p).expect("coordinate pattern is valid"))
    })
}

/// `DDMM.MMMM`, `-D-M.M` or packed `DDMMmmmm` to decimal degrees.
fn parse_coordinate(raw: &str) -> Option<f64> {
    let [dashed, decimal, packed] = latlon_patterns();
    let (degrees, minutes) = if let Some(c) = dashed.captures(raw) {
        (c[1].parse::<f64>().ok()?, c[2].parse::<f64>().ok()?)
    } else if let Some(c) = decimal.captures(raw) {
        (c[1].parse::<f64>().ok()?, c[2].parse::<f64>().ok()?)
    } else if let Some(c) = packed.captures(raw) {
        let minutes = format!("{}.{}", &c[2], &c[3]);
        (c[1].parse::<f64>().ok()?, minutes.parse::<f64>().ok()?)
    } else {
        return None;
    };
    Some(degrees + minutes / 60.0)
}

fn parse_position(
    timestamp: i64,
    lat: &str,
    ns: &str,
    lon: &str,
    ew: &str,
) -> Result<Fix, FrameDecodeError> {
    let coordinate = |raw: &str| {
        parse_coordinate(raw).ok_or_else(|| malformed(format!("bad coordinate {raw:?}")))
    };
    let mut latitude = coordinate(lat)?;
    if ns == "S" {
        latitude = -latitude;
    }
    let mut longitude = coordinate(lon)?;
    if ew == "W" {
        longitude = -longitude;
    }
    Ok(Fix::new(timestamp, latitude, longitude))
}

fn reply_time(now: i64) -> String {
    DateTime::<Utc>::from_timestamp(now, 0)
        .unwrap_or_default()
        .format("%Y%m%d%H%M%S")
        .to_string()
}

fn v4_reply(id: &str, kind: &str, now: i64) -> Event {
    Event::Reply(format!("*HQ,{},V4,{},{}#", id, kind, reply_time(now)).into_bytes())
}

fn decode_text(sentence: &str, ctx: &Context) -> Result<Vec<Event>, FrameDecodeError> {
    let body = sentence
        .strip_prefix('*')
        .map(|s| s.strip_suffix('#').unwrap_or(s))
        .unwrap_or(sentence);
    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < 3 || fields[0].len() != 2 {
        return Ok(vec![Event::Ignored(format!("unrecognized sentence {sentence:?}"))]);
    }
    let (raw_id, command, data) = (fields[1], fields[2], &fields[3..]);
    if !raw_id.bytes().all(|c| c.is_ascii_digit()) {
        return Ok(vec![Event::Ignored(format!("unrecognized sentence {sentence:?}"))]);
    }

    let raw_id = if raw_id.is_empty() {
        ctx.identity
            .ok_or_else(|| malformed("sentence without device id"))?
    } else {
        raw_id
    };
    let imei = if raw_id.len() == SHORT_ID_LEN {
        from_short_id(raw_id).ok_or_else(|| malformed("bad short id"))?
    } else {
        raw_id.to_string()
    };
    // Devices with short ids expect their own id back.
    let reply_id = if raw_id.len() == SHORT_ID_LEN {
        raw_id
    } else {
        imei.as_str()
    };

    let mut events = vec![Event::Identify(imei.clone())];
    let result = match command {
        "NBR" => Ok(vec![v4_reply(reply_id, "NBR", ctx.now)]),
        "LINK" | "V3" | "SMS" => Ok(vec![Event::Ignored(command.to_string())]),
        "VP1" => decode_vp1(data, ctx.now),
        "V0" | "HTBT" => {
            let mut out = Vec::new();
            if let Some(level) = data.first().and_then(|v| v.trim().parse::<i64>().ok()) {
                out.push(Event::Battery(level.clamp(0, 100) as u8));
            }
            out.push(Event::Heartbeat);
            let marker = format!(",{}", command);
            let upto = sentence.find(&marker).map_or(sentence.len(), |i| i + marker.len());
            out.push(Event::Reply(format!("{}#", &sentence[..upto]).into_bytes()));
            Ok(out)
        }
        c if c.starts_with('V') => decode_location(reply_id, c, data, ctx.now),
        other => Ok(vec![Event::Ignored(other.to_string())]),
    };
    match result {
        Ok(more) => events.extend(more),
        // A bad payload costs the report, not the connection.
        Err(e) => events.push(Event::Ignored(e.to_string())),
    }
    Ok(events)
}

fn decode_location(
    reply_id: &str,
    command: &str,
    data: &[&str],
    now: i64,
) -> Result<Vec<Event>, FrameDecodeError> {
    if data.len() < 10 {
        return Ok(vec![Event::Ignored(format!("short {command} report"))]);
    }
    let parts = if command == "V4" { &data[1..] } else { data };
    let mut events = Vec::new();
    if command == "V1" {
        events.push(v4_reply(reply_id, "V1", now));
    }
    let status = parts[1];
    if status != "A" && !(status.bytes().all(|c| c.is_ascii_digit()) && !status.is_empty()) {
        events.push(Event::InvalidFix);
        return Ok(events);
    }
    let (time, date) = (parts[0], parts[8]);
    let timestamp = utc_timestamp(
        ascii_number(date, 4, 2)?,
        ascii_number(date, 2, 2)?,
        ascii_number(date, 0, 2)?,
        ascii_number(time, 0, 2)?,
        ascii_number(time, 2, 2)?,
        ascii_number(time, 4, 2)?,
    )?;
    let fix = parse_position(timestamp, parts[2], parts[3], parts[4], parts[5])?;
    events.push(Event::Fixes(vec![fix]));
    Ok(events)
}

/// `VP1,A,lat,N,lon,E,...`: no time in the report, stamped on receipt.
fn decode_vp1(data: &[&str], now: i64) -> Result<Vec<Event>, FrameDecodeError> {
    if data.len() < 5 {
        return Ok(vec![Event::Ignored("short VP1 report".into())]);
    }
    if data[0] != "A" {
        return Ok(vec![Event::InvalidFix]);
    }
    let fix = parse_position(now, data[1], data[2], data[3], data[4])?;
    Ok(vec![Event::Fixes(vec![fix])])
}

/// Battery byte: 1..=6 are coarse levels, up to 100 a percentage, 0xF1..=0xF6 charging levels.
fn decode_battery(value: u8) -> Option<u8> {
    match value {
        1..=3 => Some((value - 1) * 10),
        4..=6 => Some((value - 1) * 20),
        7..=100 => Some(value),
        0xf1..=0xf6 => Some(value - 0xf0),
        _ => None,
    }
}

/// BCD `DD MM.MMMM` (latitude) or `DDD M M.MMMM` (longitude, tens of minutes in a nibble).
fn binary_coordinate(buf: &[u8], longitude: bool) -> Option<f64> {
    let degrees = bcd_integer(buf, if longitude { 3 } else { 2 })? as f64;
    let (tens, offset, digits) = if longitude {
        ((buf.get(1)? & 0x0f) as f64, 2, 5)
    } else {
        (0.0, 1, 6)
    };
    let fraction = bcd_integer(buf.get(offset..)?, digits)? as f64;
    Some((tens * 10.0 + fraction * 0.0001) / 60.0 + degrees)
}

fn decode_binary(frame: &[u8]) -> Result<Vec<Event>, FrameDecodeError> {
    let (imei, report) = if frame.len() == BINARY_LONG {
        (hex_digits(&frame[1..9])[..15].to_string(), &frame[9..])
    } else {
        let short = hex_digits(&frame[1..6]);
        let imei = from_short_id(&short).ok_or_else(|| malformed("bad short id"))?;
        (imei, &frame[6..])
    };
    let mut events = vec![Event::Identify(imei)];
    match decode_binary_report(report) {
        Ok(more) => events.extend(more),
        Err(e) => events.push(Event::Ignored(e.to_string())),
    }
    Ok(events)
}

fn decode_binary_report(p: &[u8]) -> Result<Vec<Event>, FrameDecodeError> {
    if p.len() < 16 {
        return Err(malformed("short binary report"));
    }
    let mut events = Vec::new();
    if let Some(level) = decode_battery(p[10]).filter(|&l| l > 0) {
        events.push(Event::Battery(level));
    }
    let flags = p[15];
    if flags & 0x02 == 0 {
        events.push(Event::InvalidFix);
        return Ok(events);
    }
    let bcd = |at: usize| {
        bcd_integer(&p[at..], 2)
            .map(|v| v as u32)
            .ok_or_else(|| malformed("bad BCD time"))
    };
    let timestamp = utc_timestamp(bcd(5)?, bcd(4)?, bcd(3)?, bcd(0)?, bcd(1)?, bcd(2)?)?;
    let mut latitude =
        binary_coordinate(&p[6..], false).ok_or_else(|| malformed("bad BCD latitude"))?;
    let mut longitude =
        binary_coordinate(&p[11..], true).ok_or_else(|| malformed("bad BCD longitude"))?;
    if flags & 0x04 == 0 {
        latitude = -latitude;
    }
    if flags & 0x08 == 0 {
        longitude = -longitude;
    }
    events.push(Event::Fixes(vec![Fix::new(timestamp, latitude, longitude)]));
    Ok(events)
}
