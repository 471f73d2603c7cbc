//! Tracker wire protocols. Each family is a sans-IO frame decoder: the host passes the bytes
//! it has buffered and gets back the events of one frame plus how many bytes it used.

use crate::fix::Fix;
use crate::imei::is_imei;

pub mod codec8;
pub mod gt06;
pub mod h02;
pub mod mictrack;
pub mod queclink;
pub mod xexun;
pub mod xexun2;

/// Largest frame any family may buffer before we give up on the peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024;

/// Supported hardware families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolKind {
    Codec8,
    Gt06,
    H02,
    MicTrack,
    Queclink,
    Xexun,
    Xexun2,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 7] = [
        ProtocolKind::Codec8,
        ProtocolKind::Gt06,
        ProtocolKind::H02,
        ProtocolKind::MicTrack,
        ProtocolKind::Queclink,
        ProtocolKind::Xexun,
        ProtocolKind::Xexun2,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            ProtocolKind::Codec8 => "codec8",
            ProtocolKind::Gt06 => "gt06",
            ProtocolKind::H02 => "h02",
            ProtocolKind::MicTrack => "mictrack",
            ProtocolKind::Queclink => "queclink",
            ProtocolKind::Xexun => "xexun",
            ProtocolKind::Xexun2 => "xexun2",
        }
    }

    pub fn from_slug(slug: &str) -> Option<ProtocolKind> {
        ProtocolKind::ALL.into_iter().find(|k| k.slug() == slug)
    }

    /// Port a listener table with `enabled = true` and no `port` binds to.
    pub fn default_port(self) -> u16 {
        match self {
            ProtocolKind::Codec8 => 5027,
            ProtocolKind::Gt06 => 5023,
            ProtocolKind::H02 => 5013,
            ProtocolKind::MicTrack => 5191,
            ProtocolKind::Queclink => 5004,
            ProtocolKind::Xexun => 5006,
            ProtocolKind::Xexun2 => 5233,
        }
    }

    /// Decode one frame from the front of `buf`.
    pub fn decode(self, buf: &[u8], ctx: &Context) -> Result<Decoded, FrameDecodeError> {
        match self {
            ProtocolKind::Codec8 => codec8::decode_frame(buf, ctx),
            ProtocolKind::Gt06 => gt06::decode_frame(buf, ctx),
            ProtocolKind::H02 => h02::decode_frame(buf, ctx),
            ProtocolKind::MicTrack => mictrack::decode_frame(buf, ctx),
            ProtocolKind::Queclink => queclink::decode_frame(buf, ctx),
            ProtocolKind::Xexun => xexun::decode_frame(buf, ctx),
            ProtocolKind::Xexun2 => xexun2::decode_frame(buf, ctx),
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

/// What the session knows when a frame is decoded.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub identity: Option<&'a str>,
    /// Receive time, unix seconds. Used by frames that carry no timestamp.
    pub now: i64,
}

/// Something a frame told us.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Hardware identity (decimal IMEI).
    Identify(String),
    Fixes(Vec<Fix>),
    /// Location frame without a valid GPS fix; dropped.
    InvalidFix,
    /// Battery level in percent.
    Battery(u8),
    Heartbeat,
    /// Bytes to write back to the device.
    Reply(Vec<u8>),
    /// Recognized but unused frame.
    Ignored(String),
}

impl Event {
    fn requires_identity(&self) -> bool {
        !matches!(self, Event::Identify(_) | Event::Ignored(_))
    }
}

/// One fully consumed frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub consumed: usize,
    pub events: Vec<Event>,
}

impl Decoded {
    pub fn new(consumed: usize, events: Vec<Event>) -> Self {
        Self { consumed, events }
    }

    pub fn ignored(consumed: usize, what: impl Into<String>) -> Self {
        Self::new(consumed, vec![Event::Ignored(what.into())])
    }
}

/// Error decoding a frame. Anything but `NeedMore` ends the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
    #[error("bad frame start {0:#04x}")]
    BadStart(u8),
    #[error("checksum mismatch: expected {expected:#06x}, computed {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },
    #[error("malformed frame: {0}")]
    Malformed(String),
}

pub(crate) fn malformed(what: impl Into<String>) -> FrameDecodeError {
    FrameDecodeError::Malformed(what.into())
}

/// Protocol violation at the session level.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameDecodeError),
    #[error("data before identification")]
    NotIdentified,
    #[error("invalid hardware id {0:?}")]
    InvalidIdentity(String),
    #[error("identity changed from {from} to {to}")]
    IdentityChanged { from: String, to: String },
    #[error("session closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unidentified,
    Identified,
    Closed,
}

/// Per-connection state machine for one family. Enforces identification first and a
/// stable identity for the life of the connection; any error closes the session.
#[derive(Debug)]
pub struct ProtocolSession {
    kind: ProtocolKind,
    state: SessionState,
    identity: Option<String>,
}

impl ProtocolSession {
    pub fn new(kind: ProtocolKind) -> Self {
        Self {
            kind,
            state: SessionState::Unidentified,
            identity: None,
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Decode the next frame in `buf`. `Ok(None)` means the frame is incomplete; the caller
    /// keeps the bytes and reads more. A repeated identification of the same device is
    /// filtered out so the host sees `Identify` once.
    pub fn on_bytes(&mut self, buf: &[u8], now: i64) -> Result<Option<Decoded>, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let ctx = Context {
            identity: self.identity.as_deref(),
            now,
        };
        let decoded = match self.kind.decode(buf, &ctx) {
            Ok(decoded) => decoded,
            Err(FrameDecodeError::NeedMore) => {
                if buf.len() > MAX_FRAME_LEN {
                    return Err(self.close(FrameDecodeError::TooLarge(buf.len()).into()));
                }
                return Ok(None);
            }
            Err(e) => return Err(self.close(e.into())),
        };
        let mut events = Vec::with_capacity(decoded.events.len());
        for event in decoded.events {
            if let Event::Identify(id) = event {
                if !is_imei(&id) {
                    return Err(self.close(SessionError::InvalidIdentity(id)));
                }
                match self.identity.clone() {
                    Some(current) if current == id => {}
                    Some(from) => {
                        return Err(self.close(SessionError::IdentityChanged { from, to: id }));
                    }
                    None => {
                        self.identity = Some(id.clone());
                        self.state = SessionState::Identified;
                        events.push(Event::Identify(id));
                    }
                }
                continue;
            }
            if self.identity.is_none() && event.requires_identity() {
                return Err(self.close(SessionError::NotIdentified));
            }
            events.push(event);
        }
        Ok(Some(Decoded::new(decoded.consumed, events)))
    }

    /// Explicit close (EOF, idle timeout, store failure during identification).
    pub fn shutdown(&mut self) {
        self.state = SessionState::Closed;
    }

    fn close(&mut self, err: SessionError) -> SessionError {
        self.state = SessionState::Closed;
        err
    }
}

/// Big-endian reader over one frame's bytes. Running past the end is a malformed frame.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], FrameDecodeError> {
        if self.remaining() < n {
            return Err(malformed(format!(
                "truncated at offset {} (wanted {} bytes)",
                self.pos, n
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FrameDecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<(), FrameDecodeError> {
        self.take(n).map(|_| ())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, FrameDecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, FrameDecodeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, FrameDecodeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, FrameDecodeError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, FrameDecodeError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub(crate) fn f32(&mut self) -> Result<f32, FrameDecodeError> {
        Ok(f32::from_be_bytes(self.array()?))
    }
}

/// Unix seconds of a UTC calendar time. Two-digit years are 20xx.
pub(crate) fn utc_timestamp(
    year: u32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> Result<i64, FrameDecodeError> {
    let year = if year < 100 { year + 2000 } else { year };
    chrono::NaiveDate::from_ymd_opt(year as i32, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .map(|t| t.and_utc().timestamp())
        .ok_or_else(|| {
            malformed(format!(
                "invalid date {year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
            ))
        })
}

/// `digits` ASCII decimal digits starting at `at`, e.g. one field of `yyMMddHHmmss`.
pub(crate) fn ascii_number(s: &str, at: usize, digits: usize) -> Result<u32, FrameDecodeError> {
    s.get(at..at + digits)
        .filter(|part| part.bytes().all(|c| c.is_ascii_digit()))
        .and_then(|part| part.parse().ok())
        .ok_or_else(|| malformed(format!("bad number in {s:?}")))
}

/// Lithium cell voltage to charge percent, linear over 3400-4200 mV.
pub fn battery_from_millivolts(mv: u32) -> u8 {
    let clamped = mv.clamp(3400, 4200);
    ((clamped - 3400) * 100 / 800) as u8
}

/// `ddmm.mmmm` (degrees and decimal minutes) to decimal degrees.
pub(crate) fn ddmm_to_degrees(value: f64) -> f64 {
    let degrees = (value / 100.0).trunc();
    degrees + (value - degrees * 100.0) / 60.0
}
