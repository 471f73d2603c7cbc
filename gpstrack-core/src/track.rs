//! Update engine: plan the merge of a fix batch into a device's encoded track.
//! Pure: the host loads a [`TrackState`], calls [`merge`], persists the result and runs the
//! side effects described by [`Merge`].

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::fix::Fix;

/// Encoded track plus the cached summary fields kept next to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackState {
    pub encoded: String,
    pub last_fix: Option<Fix>,
    pub count: usize,
}

impl TrackState {
    /// Build the cached fields from an encoded track.
    pub fn from_encoded(encoded: String) -> Result<Self, CodecError> {
        let last_fix = codec::last_fix(&encoded)?;
        let count = codec::count(&encoded);
        Ok(Self {
            encoded,
            last_fix,
            count,
        })
    }

    pub fn fixes(&self) -> Result<Vec<Fix>, CodecError> {
        codec::decode(&self.encoded)
    }

    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }
}

/// How a batch is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Merge into the existing track.
    Append,
    /// Erase the track first; the batch becomes the whole track.
    Reset,
}

/// Validated batch: deduplicated by timestamp (last wins) and sorted ascending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub fixes: Vec<Fix>,
    pub rejected: usize,
}

/// Validate, deduplicate and sort an incoming batch. Invalid fixes are counted and dropped.
pub fn prepare_batch(fixes: &[Fix]) -> Batch {
    let mut by_ts: BTreeMap<i64, Fix> = BTreeMap::new();
    let mut rejected = 0;
    for fix in fixes {
        match fix.validated() {
            Ok(valid) => {
                by_ts.insert(valid.timestamp, valid);
            }
            Err(_) => rejected += 1,
        }
    }
    Batch {
        fixes: by_ts.into_values().collect(),
        rejected,
    }
}

/// Outcome of [`merge`]: the new track and what changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
    pub track: TrackState,
    /// Newly accepted fixes, ascending. Empty when the batch changed nothing.
    pub added: Vec<Fix>,
    /// The whole track was re-encoded (historical insert or reset).
    pub rewritten: bool,
    /// Fixes dropped by validation.
    pub rejected: usize,
}

impl Merge {
    /// Time window touched by the accepted fixes.
    pub fn window(&self) -> Option<(i64, i64)> {
        Some((self.added.first()?.timestamp, self.added.last()?.timestamp))
    }

    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && !self.rewritten
    }
}

/// Merge `fixes` into `current`.
///
/// Fixes newer than the cached last fix are encoded against it and appended byte-wise.
/// Older (or equal) fixes force a decode, sorted insertion of the timestamps not already
/// present, and a full re-encode. Historical fixes are applied before fresh ones.
pub fn merge(current: &TrackState, fixes: &[Fix], mode: MergeMode) -> Result<Merge, CodecError> {
    let mut track = match mode {
        MergeMode::Append => reconciled(current)?,
        MergeMode::Reset => TrackState::default(),
    };
    let rewritten_by_reset = mode == MergeMode::Reset && !current.is_empty();
    let batch = prepare_batch(fixes);

    let cutoff = track.last_fix.map(|f| f.timestamp);
    let (historical, fresh): (Vec<Fix>, Vec<Fix>) = batch
        .fixes
        .into_iter()
        .partition(|f| cutoff.is_some_and(|c| f.timestamp <= c));

    let mut added = Vec::with_capacity(historical.len() + fresh.len());
    let mut rewritten = rewritten_by_reset;

    if !historical.is_empty() {
        let mut existing = codec::decode(&track.encoded)?;
        let mut known: HashSet<i64> = existing.iter().map(|f| f.timestamp).collect();
        for fix in historical {
            if known.insert(fix.timestamp) {
                added.push(fix);
            }
        }
        if !added.is_empty() {
            existing.extend_from_slice(&added);
            existing.sort_by_key(|f| f.timestamp);
            track.encoded = codec::encode(&existing);
            track.count = existing.len();
            track.last_fix = existing.last().copied();
            rewritten = true;
        }
    }

    if !fresh.is_empty() {
        let suffix = codec::encode_from(track.last_fix.as_ref(), &fresh);
        track.encoded.push_str(&suffix);
        track.count += fresh.len();
        track.last_fix = fresh.last().copied();
        added.extend(fresh);
    }

    Ok(Merge {
        track,
        added,
        rewritten,
        rejected: batch.rejected,
    })
}

/// Cached fields can be missing on tracks written by older producers; rebuild them from the
/// encoded string when they disagree in emptiness.
fn reconciled(current: &TrackState) -> Result<TrackState, CodecError> {
    if current.last_fix.is_none() && !current.encoded.is_empty() {
        return TrackState::from_encoded(current.encoded.clone());
    }
    Ok(current.clone())
}

/// Merge overlapping or touching `[start, end]` periods into a sorted disjoint list.
pub fn simplify_periods(periods: &[(i64, i64)]) -> Vec<(i64, i64)> {
    let mut sorted: Vec<(i64, i64)> = periods
        .iter()
        .map(|&(a, b)| (a.min(b), a.max(b)))
        .collect();
    sorted.sort_unstable();
    let mut out: Vec<(i64, i64)> = Vec::with_capacity(sorted.len());
    for (start, end) in sorted {
        match out.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => out.push((start, end)),
        }
    }
    out
}

/// Keep only the fixes inside the union of `periods`; the track is rewritten from scratch.
pub fn retain_periods(current: &TrackState, periods: &[(i64, i64)]) -> Result<Merge, CodecError> {
    let periods = simplify_periods(periods);
    let kept: Vec<Fix> = current
        .fixes()?
        .into_iter()
        .filter(|f| {
            periods
                .iter()
                .any(|&(start, end)| start <= f.timestamp && f.timestamp <= end)
        })
        .collect();
    let mut merged = merge(current, &kept, MergeMode::Reset)?;
    // Nothing new was accepted; the kept fixes were already stored.
    merged.added.clear();
    Ok(merged)
}
