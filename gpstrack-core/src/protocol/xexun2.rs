//! Xexun2 binary protocol. Frames are delimited by `FA AF`; the delimiter and escape
//! sequences inside a frame are escaped with `FB BF 01` and `FB BF 02`.

use crate::checksum::xexun2_checksum;
use crate::fix::Fix;
use crate::imei::{encode_bcd, hex_digits};

use super::{ddmm_to_degrees, malformed, Context, Cursor, Decoded, Event, FrameDecodeError};

const DELIMITER: [u8; 2] = [0xfa, 0xaf];
const ESCAPE: [u8; 2] = [0xfb, 0xbf];
const CMD_POSITION: u16 = 0x14;
const MASK_GPS: u8 = 0x01;
const MASK_BATTERY: u8 = 0x02;
/// command, index, imei, length, checksum
const HEADER_LEN: usize = 2 + 2 + 8 + 2 + 2;

pub fn decode_frame(buf: &[u8], _ctx: &Context) -> Result<Decoded, FrameDecodeError> {
    if buf.len() < 2 {
        return match buf.first() {
            Some(&b) if b != DELIMITER[0] => Err(FrameDecodeError::BadStart(b)),
            _ => Err(FrameDecodeError::NeedMore),
        };
    }
    if buf[..2] != DELIMITER {
        return Err(FrameDecodeError::BadStart(buf[0]));
    }
    let end = buf[2..]
        .windows(2)
        .position(|w| w == DELIMITER)
        .map(|i| i + 2)
        .ok_or(FrameDecodeError::NeedMore)?;
    let body = unescape(&buf[2..end])?;
    let events = decode_body(&body)?;
    Ok(Decoded::new(end + 2, events))
}

fn unescape(raw: &[u8]) -> Result<Vec<u8>, FrameDecodeError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i..].starts_with(&ESCAPE) {
            match raw.get(i + 2) {
                Some(0x01) => out.extend_from_slice(&DELIMITER),
                Some(0x02) => out.extend_from_slice(&ESCAPE),
                _ => return Err(malformed("bad escape sequence")),
            }
            i += 3;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn escape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 4);
    let mut i = 0;
    while i < body.len() {
        if body[i..].starts_with(&DELIMITER) {
            out.extend_from_slice(&[ESCAPE[0], ESCAPE[1], 0x01]);
            i += 2;
        } else if body[i..].starts_with(&ESCAPE) {
            out.extend_from_slice(&[ESCAPE[0], ESCAPE[1], 0x02]);
            i += 2;
        } else {
            out.push(body[i]);
            i += 1;
        }
    }
    out
}

fn frame(command: u16, index: u16, imei_bcd: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(HEADER_LEN + payload.len());
    body.extend_from_slice(&command.to_be_bytes());
    body.extend_from_slice(&index.to_be_bytes());
    body.extend_from_slice(imei_bcd);
    body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    body.extend_from_slice(&xexun2_checksum(payload).to_be_bytes());
    body.extend_from_slice(payload);
    let mut out = DELIMITER.to_vec();
    out.extend(escape(&body));
    out.extend_from_slice(&DELIMITER);
    out
}

fn decode_body(body: &[u8]) -> Result<Vec<Event>, FrameDecodeError> {
    let mut c = Cursor::new(body);
    let command = c.u16()?;
    let index = c.u16()?;
    let imei = hex_digits(c.take(8)?)[..15].to_string();
    let len = c.u16()? as usize;
    let expected = c.u16()?;
    let payload = c.take(len)?;
    let actual = xexun2_checksum(payload);
    if expected != actual {
        return Err(FrameDecodeError::Checksum { expected, actual });
    }
    let ack_id = encode_bcd(&format!("{imei}0")).ok_or_else(|| malformed("non-decimal imei"))?;

    let mut events = vec![Event::Identify(imei)];
    if command == CMD_POSITION {
        events.extend(decode_positions(payload)?);
    } else {
        events.push(Event::Ignored(format!("command {command:#06x}")));
    }
    events.push(Event::Reply(frame(command, index, &ack_id, &[0x01])));
    Ok(events)
}

/// `version u8, count u8`, then `count` × `len u16 | ts u32 | mask u8 | fields.. ` padded to len.
fn decode_positions(payload: &[u8]) -> Result<Vec<Event>, FrameDecodeError> {
    let mut c = Cursor::new(payload);
    let _version = c.u8()?;
    let count = c.u8()?;
    let mut fixes = Vec::new();
    let mut invalid = false;
    let mut battery = None;
    for _ in 0..count {
        let len = c.u16()? as usize;
        let mut r = Cursor::new(c.take(len)?);
        let timestamp = r.u32()? as i64;
        let mask = r.u8()?;
        if mask & MASK_GPS != 0 {
            let satellites = r.u8()?;
            let lon = r.f32()? as f64;
            let lat = r.f32()? as f64;
            if satellites > 0 {
                fixes.push(Fix::new(timestamp, ddmm_to_degrees(lat), ddmm_to_degrees(lon)));
            } else {
                invalid = true;
            }
        }
        if mask & MASK_BATTERY != 0 {
            battery = Some(r.u8()?.min(100));
        }
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
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: Context<'static> = Context {
        identity: None,
        now: 0,
    };
    const IMEI_BCD: [u8; 8] = [0x86, 0x52, 0x05, 0x03, 0x03, 0x30, 0x01, 0x20];

    fn record(ts: u32, sats: u8, lat: f32, lon: f32, battery: Option<u8>) -> Vec<u8> {
        let mut body = ts.to_be_bytes().to_vec();
        body.push(MASK_GPS | if battery.is_some() { MASK_BATTERY } else { 0 });
        body.push(sats);
        body.extend_from_slice(&lon.to_be_bytes());
        body.extend_from_slice(&lat.to_be_bytes());
        body.extend(battery);
        body.extend_from_slice(&[0, 0]); // fields we do not read
        let mut out = (body.len() as u16).to_be_bytes().to_vec();
        out.extend(body);
        out
    }

    #[test]
    fn position_record_and_ack() {
        let mut payload = vec![1, 2];
        payload.extend(record(1_710_505_845, 8, 6030.0, -2415.0, Some(77)));
        payload.extend(record(1_710_505_850, 0, 0.0, 0.0, None));
        let wire = frame(CMD_POSITION, 0xfaaf, &IMEI_BCD, &payload);
        let decoded = decode_frame(&wire, &CTX).unwrap();
        assert_eq!(decoded.consumed, wire.len());

        let ack_id = encode_bcd("8652050303300120").unwrap();
        assert_eq!(
            decoded.events,
            vec![
                Event::Identify("865205030330012".into()),
                Event::Fixes(vec![Fix::new(1_710_505_845, 60.5, -24.25)]),
                Event::InvalidFix,
                Event::Battery(77),
                Event::Reply(frame(CMD_POSITION, 0xfaaf, &ack_id, &[0x01])),
            ]
        );
    }

    #[test]
    fn ack_layout() {
        let ack = frame(0x0001, 0x0002, &[0x12; 8], &[0x01]);
        let mut expected = vec![0xfa, 0xaf, 0x00, 0x01, 0x00, 0x02];
        expected.extend_from_slice(&[0x12; 8]);
        expected.extend_from_slice(&[0x00, 0x01, 0xff, 0xfe, 0x01, 0xfa, 0xaf]);
        assert_eq!(ack, expected);
    }

    #[test]
    fn escaping() {
        let body = [0x01, 0xfa, 0xaf, 0x02, 0xfb, 0xbf, 0x03];
        let escaped = escape(&body);
        assert_eq!(
            escaped,
            vec![0x01, 0xfb, 0xbf, 0x01, 0x02, 0xfb, 0xbf, 0x02, 0x03]
        );
        assert_eq!(unescape(&escaped).unwrap(), body);
        assert!(unescape(&[0xfb, 0xbf, 0x07]).is_err());
    }

    #[test]
    fn other_commands_acked() {
        let wire = frame(0x0002, 7, &IMEI_BCD, &[0x11, 0x22]);
        let events = decode_frame(&wire, &CTX).unwrap().events;
        assert!(matches!(
            events[..],
            [Event::Identify(_), Event::Ignored(_), Event::Reply(_)]
        ));
    }

    #[test]
    fn checksum_and_framing_errors() {
        let mut wire = frame(0x0002, 7, &IMEI_BCD, &[0x11, 0x22]);
        let at = wire.len() - 3;
        wire[at] ^= 0x01;
        assert!(matches!(
            decode_frame(&wire, &CTX),
            Err(FrameDecodeError::Checksum { .. })
        ));
        assert_eq!(
            decode_frame(&wire[..wire.len() - 1], &CTX),
            Err(FrameDecodeError::NeedMore)
        );
        assert_eq!(
            decode_frame(&[0x00, 0x01], &CTX),
            Err(FrameDecodeError::BadStart(0x00))
        );
    }
}
