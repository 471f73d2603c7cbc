//! Teltonika Codec8 / Codec8 Extended over TCP.
//!
//! Identification is a length-prefixed ASCII IMEI answered with `0x01`. Data packets are
//! `00000000 | u32 len | codec, count, records.., count | u32 crc16/ibm`, answered with the
//! record count.

use crate::checksum::crc16_ibm;
use crate::fix::Fix;

use super::{malformed, Context, Cursor, Decoded, Event, FrameDecodeError, MAX_FRAME_LEN};

const CODEC8: u8 = 0x08;
const CODEC8_EXT: u8 = 0x8e;
const IO_BATTERY_LEVEL: u16 = 113;
const MAX_IMEI_LEN: usize = 32;

pub fn decode_frame(buf: &[u8], _ctx: &Context) -> Result<Decoded, FrameDecodeError> {
    if buf.len() < 2 {
        return Err(FrameDecodeError::NeedMore);
    }
    let prefix = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if prefix != 0 {
        return decode_identification(buf, prefix);
    }
    if buf.len() < 8 {
        return Err(FrameDecodeError::NeedMore);
    }
    if buf[2] != 0 || buf[3] != 0 {
        return Err(malformed("nonzero AVL preamble"));
    }
    let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    let total = 8 + len + 4;
    if buf.len() < total {
        return Err(FrameDecodeError::NeedMore);
    }
    let data = &buf[8..8 + len];
    let stored = u32::from_be_bytes([buf[8 + len], buf[9 + len], buf[10 + len], buf[11 + len]]);
    let actual = crc16_ibm(data);
    if stored != actual as u32 {
        return Err(FrameDecodeError::Checksum {
            expected: stored as u16,
            actual,
        });
    }
    let events = decode_avl(data)?;
    Ok(Decoded::new(total, events))
}

fn decode_identification(buf: &[u8], len: usize) -> Result<Decoded, FrameDecodeError> {
    if len > MAX_IMEI_LEN {
        return Err(malformed(format!("identification length {len}")));
    }
    if buf.len() < 2 + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let imei = std::str::from_utf8(&buf[2..2 + len])
        .map_err(|_| malformed("identification is not ASCII"))?;
    Ok(Decoded::new(
        2 + len,
        vec![Event::Identify(imei.to_string()), Event::Reply(vec![0x01])],
    ))
}

fn decode_avl(data: &[u8]) -> Result<Vec<Event>, FrameDecodeError> {
    let mut c = Cursor::new(data);
    let codec = c.u8()?;
    let extended = match codec {
        CODEC8 => false,
        CODEC8_EXT => true,
        other => return Err(malformed(format!("unsupported codec {other:#04x}"))),
    };
    let count = c.u8()?;
    let mut fixes = Vec::with_capacity(count as usize);
    let mut invalid = false;
    let mut battery = None;
    for _ in 0..count {
        let record = decode_record(&mut c, extended)?;
        match record.fix {
            Some(fix) => fixes.push(fix),
            None => invalid = true,
        }
        if record.battery.is_some() {
            battery = record.battery;
        }
    }
    let trailer = c.u8()?;
    if trailer != count || c.remaining() != 0 {
        return Err(malformed(format!(
            "record count mismatch ({count} vs {trailer})"
        )));
    }

    let mut events = Vec::new();
    if !fixes.is_empty() {
        events.push(Event::Fixes(fixes));
    }
    if invalid {
        events.push(Event::InvalidFix);
    }
    if let Some(level) = battery {
        events.push(Event::Battery(level));
    }
    events.push(Event::Reply((count as u32).to_be_bytes().to_vec()));
    Ok(events)
}

struct Record {
    fix: Option<Fix>,
    battery: Option<u8>,
}

fn decode_record(c: &mut Cursor, extended: bool) -> Result<Record, FrameDecodeError> {
    let timestamp_ms = c.u64()?;
    let _priority = c.u8()?;
    let lon = c.i32()?;
    let lat = c.i32()?;
    let _altitude = c.u16()?;
    let _angle = c.u16()?;
    let satellites = c.u8()?;
    let _speed = c.u16()?;

    let battery = decode_io(c, extended)?;
    let fix = (satellites > 0).then(|| {
        Fix::new(
            (timestamp_ms / 1000) as i64,
            lat as f64 / 1e7,
            lon as f64 / 1e7,
        )
    });
    Ok(Record { fix, battery })
}

/// Walk the IO element block; returns the battery level when present.
fn decode_io(c: &mut Cursor, extended: bool) -> Result<Option<u8>, FrameDecodeError> {
    let _event_id = read_n(c, extended)?;
    let _total = read_n(c, extended)?;
    let mut battery = None;
    for width in [1usize, 2, 4, 8] {
        let n = read_n(c, extended)?;
        for _ in 0..n {
            let id = read_n(c, extended)?;
            let value = c.take(width)?;
            if id == IO_BATTERY_LEVEL {
                let level = value.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
                battery = Some(level.min(100) as u8);
            }
        }
    }
    if extended {
        let n = c.u16()?;
        for _ in 0..n {
            let _id = c.u16()?;
            let len = c.u16()? as usize;
            c.skip(len)?;
        }
    }
    Ok(battery)
}

/// IO ids and counts are one byte wide in Codec8, two in Codec8 Extended.
fn read_n(c: &mut Cursor, extended: bool) -> Result<u16, FrameDecodeError> {
    if extended {
        c.u16()
    } else {
        c.u8().map(u16::from)
    }
}
