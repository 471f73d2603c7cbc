//! Line encoding for the legacy live-position relay.
//!
//! Each line carries up to [`POINTS_PER_LINE`] fixes: the first as absolute
//! `t_lng_lat.`, the rest as deltas, packed into single characters when small.

use std::fmt::Write;

use crate::fix::Fix;

pub const POINTS_PER_LINE: usize = 29;
/// Relay timestamps count from 2006-01-01T00:00:00Z.
pub const RELAY_EPOCH: i64 = 1_136_073_600;
const SMALL_LIMIT: i64 = 31;

/// Identity the relay knows a device by.
pub fn relay_identity(device_id: &str) -> String {
    format!("rc{}", device_id)
}

fn small_number(value: i64) -> char {
    let code = if value < -21 {
        79 + value
    } else if value < 5 {
        86 + value
    } else {
        92 + value
    };
    char::from(code as u8)
}

fn relay_point(fix: &Fix) -> [i64; 3] {
    [
        fix.timestamp - RELAY_EPOCH,
        (fix.longitude * 5e4).round_ties_even() as i64,
        (fix.latitude * 1e5).round_ties_even() as i64,
    ]
}

/// Encode `fixes` for relay under `identity`. Empty input yields an empty string.
pub fn encode_relay(identity: &str, fixes: &[Fix]) -> String {
    let mut out = String::new();
    for line in fixes.chunks(POINTS_PER_LINE) {
        let mut prev: Option<[i64; 3]> = None;
        for fix in line {
            let point = relay_point(fix);
            match prev {
                None => {
                    let _ = write!(out, "{}.{}_{}_{}.", identity, point[0], point[1], point[2]);
                }
                Some(last) => {
                    let d = [point[0] - last[0], point[1] - last[1], point[2] - last[2]];
                    if d.iter().all(|v| v.abs() < SMALL_LIMIT) {
                        out.extend(d.iter().map(|&v| small_number(v)));
                        out.push('.');
                    } else {
                        let _ = write!(out, "{}_{}_{}.", d[0], d[1], d[2]);
                    }
                }
            }
            prev = Some(point);
        }
        out.push('\n');
    }
    out
}
