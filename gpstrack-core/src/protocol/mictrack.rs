//! MicTrack line protocol: `MT;mode;imei;type;v1+v2+...` one report per line.

use crate::fix::Fix;

use super::{
    ascii_number, battery_from_millivolts, malformed, utc_timestamp, Context, Decoded, Event,
    FrameDecodeError,
};

pub fn decode_frame(buf: &[u8], _ctx: &Context) -> Result<Decoded, FrameDecodeError> {
    let end = buf
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(FrameDecodeError::NeedMore)?;
    let line = String::from_utf8_lossy(&buf[..end]);
    let line = line.trim().trim_end_matches('#');
    if line.is_empty() {
        return Ok(Decoded::new(end + 1, Vec::new()));
    }
    Ok(Decoded::new(end + 1, decode_line(line)?))
}

fn decode_line(line: &str) -> Result<Vec<Event>, FrameDecodeError> {
    let fields: Vec<&str> = line.splitn(5, ';').collect();
    let [tag, _mode, imei, kind, values] = fields[..] else {
        return Ok(vec![Event::Ignored(format!("unrecognized line {line:?}"))]);
    };
    if tag != "MT" {
        return Ok(vec![Event::Ignored(format!("unrecognized line {line:?}"))]);
    }
    let values: Vec<&str> = values.split('+').collect();
    let mut events = vec![Event::Identify(imei.to_string())];
    match kind {
        "R0" => events.extend(decode_gps(&values)?),
        "R1" | "R2" | "R3" => {
            if let Some(level) = trailing_battery(&values) {
                events.push(Event::Battery(level));
            }
            events.push(Event::Ignored(format!("{kind} report without GPS")));
        }
        _ => events.push(Event::Heartbeat),
    }
    Ok(events)
}

/// `event+yyMMddHHmmss+lat+lon+speed+course+satellites+battery_mv+...`
fn decode_gps(values: &[&str]) -> Result<Vec<Event>, FrameDecodeError> {
    if values.len() < 8 {
        return Err(malformed(format!("R0 report with {} values", values.len())));
    }
    let time = values[1];
    if time.len() != 12 {
        return Err(malformed(format!("bad time {time:?}")));
    }
    let timestamp = utc_timestamp(
        ascii_number(time, 0, 2)?,
        ascii_number(time, 2, 2)?,
        ascii_number(time, 4, 2)?,
        ascii_number(time, 6, 2)?,
        ascii_number(time, 8, 2)?,
        ascii_number(time, 10, 2)?,
    )?;
    let number = |i: usize| -> Result<f64, FrameDecodeError> {
        values[i]
            .parse()
            .map_err(|_| malformed(format!("bad value {:?}", values[i])))
    };
    let latitude = number(2)?;
    let longitude = number(3)?;
    let mut events = vec![Event::Fixes(vec![Fix::new(timestamp, latitude, longitude)])];
    if let Ok(mv) = values[7].parse::<u32>() {
        events.push(Event::Battery(battery_from_millivolts(mv)));
    }
    Ok(events)
}

/// LBS and Wi-Fi reports end with the cell voltage in millivolts.
fn trailing_battery(values: &[&str]) -> Option<u8> {
    let mv: u32 = values.last()?.parse().ok()?;
    (2500..=5000)
        .contains(&mv)
        .then(|| battery_from_millivolts(mv))
}
