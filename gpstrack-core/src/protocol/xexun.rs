//! Xexun text protocol: one line per report embedding a GPRMC sentence and `imei:`.

use std::sync::OnceLock;

use regex::Regex;

use crate::fix::Fix;

use super::{
    ascii_number, battery_from_millivolts, ddmm_to_degrees, malformed, utc_timestamp, Context,
    Decoded, Event, FrameDecodeError,
};

struct Patterns {
    rmc: Regex,
    imei: Regex,
    battery: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        rmc: Regex::new(
            r"GPRMC,(\d{6})(?:\.\d+)?,([AV]),(\d+\.\d+),([NS]),(\d+\.\d+),([EW]),[^,]*,[^,]*,(\d{6})",
        )
        .expect("GPRMC pattern is valid"),
        imei: Regex::new(r"imei:(\d+)").expect("imei pattern is valid"),
        battery: Regex::new(r"F:(\d+\.\d+)V").expect("battery pattern is valid"),
    })
}

pub fn decode_frame(buf: &[u8], _ctx: &Context) -> Result<Decoded, FrameDecodeError> {
    let end = buf
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(FrameDecodeError::NeedMore)?;
    let line = String::from_utf8_lossy(&buf[..end]);
    Ok(Decoded::new(end + 1, decode_line(line.trim())?))
}

fn decode_line(line: &str) -> Result<Vec<Event>, FrameDecodeError> {
    if line.is_empty() {
        return Ok(Vec::new());
    }
    let p = patterns();
    let Some(imei) = p.imei.captures(line) else {
        return Ok(vec![Event::Ignored("line without imei".into())]);
    };
    let mut events = vec![Event::Identify(imei[1].to_string())];

    match p.rmc.captures(line) {
        Some(rmc) if &rmc[2] == "A" => {
            let (time, date) = (&rmc[1], &rmc[7]);
            let timestamp = utc_timestamp(
                ascii_number(date, 4, 2)?,
                ascii_number(date, 2, 2)?,
                ascii_number(date, 0, 2)?,
                ascii_number(time, 0, 2)?,
                ascii_number(time, 2, 2)?,
                ascii_number(time, 4, 2)?,
            )?;
            let value = |raw: &str| -> Result<f64, FrameDecodeError> {
                raw.parse()
                    .map(ddmm_to_degrees)
                    .map_err(|_| malformed(format!("bad coordinate {raw:?}")))
            };
            let mut latitude = value(&rmc[3])?;
            if &rmc[4] == "S" {
                latitude = -latitude;
            }
            let mut longitude = value(&rmc[5])?;
            if &rmc[6] == "W" {
                longitude = -longitude;
            }
            events.push(Event::Fixes(vec![Fix::new(timestamp, latitude, longitude)]));
        }
        Some(_) => events.push(Event::InvalidFix),
        None => events.push(Event::Ignored("line without GPRMC".into())),
    }

    if let Some(volts) = p.battery.captures(line) {
        if let Ok(v) = volts[1].parse::<f64>() {
            events.push(Event::Battery(battery_from_millivolts((v * 1000.0).round() as u32)));
        }
    }
    Ok(events)
}
