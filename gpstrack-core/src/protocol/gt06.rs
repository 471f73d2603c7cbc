//! Concox GT06 binary protocol.
//!
//! Frames are `78 78 | len u8 | body | 0D 0A` or, for the extended set, `79 79 | len u16 |
//! body | 0D 0A`. The body ends with a serial number and a CRC-16/X-25 covering everything
//! from the length field up to the serial.

use std::sync::OnceLock;

use regex::Regex;

use crate::checksum::crc16_x25;
use crate::fix::Fix;
use crate::imei::hex_digits;

use super::{malformed, utc_timestamp, Context, Cursor, Decoded, Event, FrameDecodeError};

const START_SHORT: u8 = 0x78;
const START_LONG: u8 = 0x79;
const STOP: [u8; 2] = [0x0d, 0x0a];
/// serial + crc
const TRAILER_LEN: usize = 4;

const LOGIN: u8 = 0x01;
const HEARTBEAT: u8 = 0x13;
const LOCATION_TYPES: [u8; 15] = [
    0x10, 0x11, 0x12, 0x16, 0x1a, 0x1e, 0x22, 0x26, 0x27, 0x2d, 0x31, 0x32, 0x37, 0xa0, 0xa4,
];

const EXT_INFO: u8 = 0x70;
const EXT_LOCATION: [u8; 2] = [0x32, 0x33];
const EXT_TEXT: u8 = 0x21;
const INFO_POSITION: u16 = 0x0033;

const FLAG_POSITIONED: u8 = 0x10;
const FLAG_WEST: u8 = 0x08;
const FLAG_NORTH: u8 = 0x04;
/// Coordinates are half-milliminutes: degrees × 60 × 30000.
const COORD_DIV: f64 = 1_800_000.0;

/// One delimited, checksum-verified frame.
struct Frame<'a> {
    long: bool,
    /// Bytes after the length field up to (excluding) the serial.
    body: &'a [u8],
    serial: [u8; 2],
    declared_len: usize,
}

pub fn decode_frame(buf: &[u8], _ctx: &Context) -> Result<Decoded, FrameDecodeError> {
    let (frame, consumed) = split_frame(buf)?;
    let events = if frame.long {
        decode_extended(&frame)?
    } else {
        decode_short(&frame)?
    };
    Ok(Decoded::new(consumed, events))
}

fn split_frame(buf: &[u8]) -> Result<(Frame<'_>, usize), FrameDecodeError> {
    let Some(&first) = buf.first() else {
        return Err(FrameDecodeError::NeedMore);
    };
    if first != START_SHORT && first != START_LONG {
        return Err(FrameDecodeError::BadStart(first));
    }
    if buf.len() < 2 {
        return Err(FrameDecodeError::NeedMore);
    }
    if buf[1] != first {
        return Err(FrameDecodeError::BadStart(buf[1]));
    }
    let long = first == START_LONG;
    let header = if long { 4 } else { 3 };
    if buf.len() < header {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = if long {
        u16::from_be_bytes([buf[2], buf[3]]) as usize
    } else {
        buf[2] as usize
    };
    if len < 1 + TRAILER_LEN {
        return Err(malformed(format!("length {len} too short")));
    }
    let total = header + len + STOP.len();
    if buf.len() < total {
        return Err(FrameDecodeError::NeedMore);
    }
    if buf[total - 2..total] != STOP {
        return Err(malformed("missing 0D 0A terminator"));
    }
    let crc_at = header + len - 2;
    let expected = u16::from_be_bytes([buf[crc_at], buf[crc_at + 1]]);
    let actual = crc16_x25(&buf[2..crc_at]);
    if expected != actual {
        return Err(FrameDecodeError::Checksum { expected, actual });
    }
    let frame = Frame {
        long,
        body: &buf[header..crc_at - 2],
        serial: [buf[crc_at - 2], buf[crc_at - 1]],
        declared_len: len,
    };
    Ok((frame, total))
}

/// Short-form frame around `protocol`, `content` and `serial`.
pub(crate) fn build_frame(protocol: u8, content: &[u8], serial: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 6);
    body.push((1 + content.len() + TRAILER_LEN) as u8);
    body.push(protocol);
    body.extend_from_slice(content);
    body.extend_from_slice(&serial.to_be_bytes());
    wrap(&[START_SHORT, START_SHORT], body)
}

/// Long-form acknowledgement `79 79 00 05 type serial crc 0D 0A`.
fn build_ack_long(protocol: u8, serial: [u8; 2]) -> Vec<u8> {
    let mut body = vec![0x00, 0x05, protocol];
    body.extend_from_slice(&serial);
    wrap(&[START_LONG, START_LONG], body)
}

fn wrap(start: &[u8; 2], body: Vec<u8>) -> Vec<u8> {
    let crc = crc16_x25(&body);
    let mut out = Vec::with_capacity(body.len() + 6);
    out.extend_from_slice(start);
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&STOP);
    out
}

fn is_location(protocol: u8, len: usize) -> bool {
    LOCATION_TYPES.contains(&protocol)
        || (protocol == 0x17 && len == 0x28)
        || (protocol == 0x34 && len != 0x37)
        || (protocol == 0x24 && len == 0x2e)
        || (protocol == 0xa2 && len == 0x40)
}

fn decode_short(frame: &Frame) -> Result<Vec<Event>, FrameDecodeError> {
    let protocol = frame.body[0];
    let content = &frame.body[1..];
    let serial = u16::from_be_bytes(frame.serial);
    match protocol {
        LOGIN => {
            let bcd = content
                .get(..8)
                .ok_or_else(|| malformed("login without IMEI"))?;
            // 16 nibbles, the first is padding
            let imei = hex_digits(bcd)[1..].to_string();
            Ok(vec![
                Event::Identify(imei),
                Event::Reply(build_frame(LOGIN, &[], serial)),
            ])
        }
        HEARTBEAT => {
            let voltage = *content
                .get(1)
                .ok_or_else(|| malformed("heartbeat without voltage level"))?;
            let battery = (voltage as u32 * 100 / 6).min(100) as u8;
            Ok(vec![
                Event::Battery(battery),
                Event::Heartbeat,
                Event::Reply(build_frame(HEARTBEAT, &[], serial)),
            ])
        }
        p if is_location(p, frame.declared_len) => {
            let content = if p == 0x34 {
                content
                    .get(4..)
                    .ok_or_else(|| malformed("short 0x34 location"))?
            } else {
                content
            };
            Ok(vec![decode_gps(content)?])
        }
        other => Ok(vec![Event::Ignored(format!("type {other:#04x}"))]),
    }
}

/// GPS block: date(6) satellites(1) lat(4) lon(4) speed(1) course/status(2).
fn decode_gps(content: &[u8]) -> Result<Event, FrameDecodeError> {
    let mut c = Cursor::new(content);
    let date = c.take(6)?;
    let _satellites = c.u8()?;
    let lat = c.u32()?;
    let lon = c.u32()?;
    let _speed = c.u8()?;
    let flags = c.u8()?;
    if flags & FLAG_POSITIONED == 0 {
        return Ok(Event::InvalidFix);
    }
    let timestamp = date_timestamp(date)?;
    Ok(Event::Fixes(vec![coordinates(timestamp, lat, lon, flags)]))
}

fn date_timestamp(date: &[u8]) -> Result<i64, FrameDecodeError> {
    utc_timestamp(
        date[0] as u32,
        date[1] as u32,
        date[2] as u32,
        date[3] as u32,
        date[4] as u32,
        date[5] as u32,
    )
}

fn coordinates(timestamp: i64, lat: u32, lon: u32, flags: u8) -> Fix {
    let mut latitude = lat as f64 / COORD_DIV;
    if flags & FLAG_NORTH == 0 {
        latitude = -latitude;
    }
    let mut longitude = lon as f64 / COORD_DIV;
    if flags & FLAG_WEST != 0 {
        longitude = -longitude;
    }
    Fix::new(timestamp, latitude, longitude)
}

fn decode_extended(frame: &Frame) -> Result<Vec<Event>, FrameDecodeError> {
    let protocol = frame.body[0];
    let content = &frame.body[1..];
    match protocol {
        EXT_INFO => decode_info(content),
        p if EXT_LOCATION.contains(&p) => {
            let mut events = vec![Event::Reply(build_ack_long(p, frame.serial))];
            let mut c = Cursor::new(content);
            let date = c.take(6)?;
            let gps_len = c.u8()?;
            if gps_len == 0 {
                events.push(Event::InvalidFix);
                return Ok(events);
            }
            let _satellites = c.u8()?;
            let lat = c.u32()?;
            let lon = c.u32()?;
            let _speed = c.u8()?;
            let flags = c.u8()?;
            let fix = coordinates(date_timestamp(date)?, lat, lon, flags);
            events.insert(0, Event::Fixes(vec![fix]));
            Ok(events)
        }
        EXT_TEXT => decode_text(content),
        other => Ok(vec![Event::Ignored(format!("extended type {other:#04x}"))]),
    }
}

/// Information transmission: a run of `type u16 | len u16 | data` sub-packets.
fn decode_info(content: &[u8]) -> Result<Vec<Event>, FrameDecodeError> {
    let mut c = Cursor::new(content);
    let mut fixes = Vec::new();
    while c.remaining() >= 4 {
        let kind = c.u16()?;
        let len = c.u16()? as usize;
        let data = c.take(len)?;
        if kind != INFO_POSITION {
            continue;
        }
        let mut p = Cursor::new(data);
        let timestamp = p.u32()? as i64;
        p.skip(3)?;
        let lat = p.u32()?;
        let lon = p.u32()?;
        p.skip(1)?;
        let flags = p.u8()?;
        fixes.push(coordinates(timestamp, lat, lon, flags));
    }
    if fixes.is_empty() {
        return Ok(vec![Event::Ignored("information without position".into())]);
    }
    Ok(vec![Event::Fixes(fixes)])
}

fn position_text() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^Current position!Lat:([NS])(\d+\.\d+),Lon:([WE])(\d+\.\d+),Course:\d+\.\d+,Speed:\d+\.\d+,DateTime:(\d{4})-(\d{2})-(\d{2}) +(\d{2}):(\d{2}):(\d{2})$",
        )
        .expect("position text pattern is valid")
    })
}

/// Command reply text: `server flag u32 | encoding u8 | text`.
fn decode_text(content: &[u8]) -> Result<Vec<Event>, FrameDecodeError> {
    let mut c = Cursor::new(content);
    c.skip(4)?;
    let encoding = c.u8()?;
    let raw = c.take(c.remaining())?;
    let text = if encoding == 0x01 {
        String::from_utf8_lossy(raw).into_owned()
    } else {
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    };
    let Some(caps) = position_text().captures(&text) else {
        return Ok(vec![Event::Ignored("text message".into())]);
    };
    let field = |i: usize| caps.get(i).map_or("", |m| m.as_str());
    let number = |i: usize| -> Result<u32, FrameDecodeError> {
        field(i)
            .parse()
            .map_err(|_| malformed("bad date in position text"))
    };
    let parse = |i: usize| -> Result<f64, FrameDecodeError> {
        field(i)
            .parse()
            .map_err(|_| malformed("bad coordinate in position text"))
    };
    let mut latitude = parse(2)?;
    if field(1) == "S" {
        latitude = -latitude;
    }
    let mut longitude = parse(4)?;
    if field(3) == "W" {
        longitude = -longitude;
    }
    let timestamp = utc_timestamp(
        number(5)?,
        number(6)?,
        number(7)?,
        number(8)?,
        number(9)?,
        number(10)?,
    )?;
    Ok(vec![Event::Fixes(vec![Fix::new(
        timestamp, latitude, longitude,
    )])])
}
