//! GPS track ingest core: track codec, merge engine and tracker protocol decoders.
//! Host-driven: no I/O; host passes bytes and fixes in and receives events, tracks and replies.

pub mod checksum;
pub mod codec;
pub mod fix;
pub mod imei;
pub mod protocol;
pub mod relay;
pub mod track;

pub use codec::{count, decode, decode_from, diff, encode, encode_from, extract_interval, CodecError};
pub use fix::{Fix, FixValidationError};
pub use protocol::{
    Decoded, Event, FrameDecodeError, ProtocolKind, ProtocolSession, SessionError, SessionState,
};
pub use relay::{encode_relay, relay_identity};
pub use track::{merge, retain_periods, simplify_periods, Merge, MergeMode, TrackState};
