//! Queclink `@Track` ASCII protocol: comma separated sentences terminated by `$`.

use crate::fix::Fix;

use super::{ascii_number, malformed, utc_timestamp, Context, Decoded, Event, FrameDecodeError};

const TERMINATOR: u8 = b'$';
const BLOCK_START: usize = 7;
const BLOCK_LEN: usize = 12;
const POSITION_REPORTS: [&str; 11] = [
    "FRI", "GEO", "SPD", "SOS", "RTL", "PNL", "NMR", "DIS", "DOG", "IGL", "LOC",
];

pub fn decode_frame(buf: &[u8], _ctx: &Context) -> Result<Decoded, FrameDecodeError> {
    let end = buf
        .iter()
        .position(|&b| b == TERMINATOR)
        .ok_or(FrameDecodeError::NeedMore)?;
    let sentence = String::from_utf8_lossy(&buf[..end]);
    let sentence = sentence.trim();
    Ok(Decoded::new(end + 1, decode_sentence(sentence)?))
}

fn decode_sentence(sentence: &str) -> Result<Vec<Event>, FrameDecodeError> {
    let fields: Vec<&str> = sentence.split(',').collect();
    let Some((kind, report)) = fields[0].split_once(":GT") else {
        return Ok(vec![Event::Ignored(format!("unrecognized sentence {sentence:?}"))]);
    };
    match (kind, report) {
        ("+ACK", "HBD") => {
            let [_, version, imei, _name, _time, count] = fields[..] else {
                return Err(malformed(format!("heartbeat with {} fields", fields.len())));
            };
            Ok(vec![
                Event::Identify(imei.to_string()),
                Event::Heartbeat,
                Event::Reply(format!("+SACK:GTHBD,{},{}$", version, count).into_bytes()),
            ])
        }
        ("+RESP" | "+BUFF", r) if POSITION_REPORTS.contains(&r) => decode_positions(&fields),
        _ => Ok(vec![Event::Ignored(format!("{kind}:GT{report}"))]),
    }
}

/// `head, version, imei, name, report id, report type, N, N×block, ..., battery, time, count`
fn decode_positions(fields: &[&str]) -> Result<Vec<Event>, FrameDecodeError> {
    if fields.len() < BLOCK_START {
        return Err(malformed(format!("report with {} fields", fields.len())));
    }
    let n: usize = fields[6]
        .parse()
        .map_err(|_| malformed(format!("bad block count {:?}", fields[6])))?;
    let blocks_end = n
        .checked_mul(BLOCK_LEN)
        .and_then(|len| len.checked_add(BLOCK_START))
        .filter(|&end| end <= fields.len())
        .ok_or_else(|| malformed(format!("report truncated before {n} blocks")))?;
    let mut events = vec![Event::Identify(fields[2].to_string())];
    let mut fixes = Vec::with_capacity(n);
    let mut invalid = false;
    for block in fields[BLOCK_START..blocks_end].chunks(BLOCK_LEN) {
        match decode_block(block)? {
            Some(fix) => fixes.push(fix),
            None => invalid = true,
        }
    }
    if !fixes.is_empty() {
        events.push(Event::Fixes(fixes));
    }
    if invalid {
        events.push(Event::InvalidFix);
    }
    let tail = fields.len() - blocks_end;
    if tail >= 3 {
        if let Ok(level) = fields[fields.len() - 3].parse::<u8>() {
            if level <= 100 {
                events.push(Event::Battery(level));
            }
        }
    }
    Ok(events)
}

/// `accuracy, speed, azimuth, altitude, lon, lat, yyyyMMddHHmmss, mcc, mnc, lac, cell, reserved`
fn decode_block(block: &[&str]) -> Result<Option<Fix>, FrameDecodeError> {
    let accuracy = block[0];
    if accuracy.is_empty() || accuracy == "0" {
        return Ok(None);
    }
    let coordinate = |raw: &str| -> Result<f64, FrameDecodeError> {
        raw.parse()
            .map_err(|_| malformed(format!("bad coordinate {raw:?}")))
    };
    let longitude = coordinate(block[4])?;
    let latitude = coordinate(block[5])?;
    let time = block[6];
    if time.len() != 14 {
        return Err(malformed(format!("bad time {time:?}")));
    }
    let timestamp = utc_timestamp(
        ascii_number(time, 0, 4)?,
        ascii_number(time, 4, 2)?,
        ascii_number(time, 6, 2)?,
        ascii_number(time, 8, 2)?,
        ascii_number(time, 10, 2)?,
        ascii_number(time, 12, 2)?,
    )?;
    Ok(Some(Fix::new(timestamp, latitude, longitude)))
}
