//! Device registry: identity resolution plus persistence of tracks and cached fields.
//!
//! [`DeviceRegistry`] is the seam to the storage backend. [`MemoryRegistry`] keeps every
//! record in a `DashMap` and can snapshot itself to a bincode file across restarts.

use std::path::Path;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use gpstrack_core::{Fix, TrackState};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reference to a device, cheap to clone and hold for the life of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    /// Registry-assigned id, also the relay identity suffix.
    pub id: String,
    pub identity: String,
    pub prefix: String,
}

impl DeviceHandle {
    /// Storage key: the per-listener prefix keeps vendors with overlapping ids apart.
    pub fn key(&self) -> String {
        device_key(&self.prefix, &self.identity)
    }
}

fn device_key(prefix: &str, identity: &str) -> String {
    format!("{}{}", prefix, identity)
}

/// Everything stored for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub identity: String,
    pub prefix: String,
    pub track: TrackState,
    pub battery: Option<u8>,
    /// Relay live positions until this unix time.
    pub relay_until: Option<i64>,
    /// Bumped by every successful [`DeviceRegistry::save`].
    pub version: u64,
}

impl DeviceRecord {
    fn new(id: String, identity: &str, prefix: &str) -> Self {
        Self {
            id,
            identity: identity.to_string(),
            prefix: prefix.to_string(),
            track: TrackState::default(),
            battery: None,
            relay_until: None,
            version: 0,
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            id: self.id.clone(),
            identity: self.identity.clone(),
            prefix: self.prefix.clone(),
        }
    }

    pub fn should_relay(&self, now: i64) -> bool {
        self.relay_until.is_some_and(|until| now <= until)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("device {device} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        device: String,
        expected: u64,
        actual: u64,
    },
    #[error("unknown device {0}")]
    NotFound(String),
    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry snapshot encoding: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Storage backend for devices. Implementations must make `save` fail with
/// [`RegistryError::Conflict`] when the record moved past `expected_version`.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn resolve_or_create(
        &self,
        identity: &str,
        prefix: &str,
    ) -> Result<DeviceHandle, RegistryError>;

    /// Telemetry only; does not touch the track or its version.
    async fn set_battery(&self, handle: &DeviceHandle, level: u8) -> Result<(), RegistryError>;

    async fn get_last_fix(&self, handle: &DeviceHandle) -> Result<Option<Fix>, RegistryError>;

    async fn get_encoded_track(&self, handle: &DeviceHandle) -> Result<String, RegistryError>;

    /// Whole record, including the version a later `save` must present.
    async fn snapshot(&self, handle: &DeviceHandle) -> Result<DeviceRecord, RegistryError>;

    /// Store `track` and `battery` (kept when `None`). Returns the new version.
    async fn save(
        &self,
        handle: &DeviceHandle,
        track: &TrackState,
        battery: Option<u8>,
        expected_version: u64,
    ) -> Result<u64, RegistryError>;
}

/// In-memory registry keyed by `prefix + identity`.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    devices: DashMap<String, DeviceRecord>,
    /// Every assigned id, plus ids reserved by creations in flight.
    ids: DashSet<String>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Enable (or with `None` disable) relaying of live positions.
    pub fn set_relay_until(
        &self,
        handle: &DeviceHandle,
        until: Option<i64>,
    ) -> Result<(), RegistryError> {
        let mut record = self
            .devices
            .get_mut(&handle.key())
            .ok_or_else(|| RegistryError::NotFound(handle.key()))?;
        record.relay_until = until;
        Ok(())
    }

    /// Load a snapshot written by [`persist_to`](Self::persist_to). A missing file is an
    /// empty registry.
    pub fn load_from(path: &Path) -> Result<Self, RegistryError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let records: Vec<DeviceRecord> = bincode::deserialize(&bytes)?;
        let ids = records.iter().map(|r| r.id.clone()).collect();
        let devices = records
            .into_iter()
            .map(|r| (device_key(&r.prefix, &r.identity), r))
            .collect();
        Ok(Self { devices, ids })
    }

    /// Write every record to `path` through a temporary file and rename.
    pub fn persist_to(&self, path: &Path) -> Result<(), RegistryError> {
        let records: Vec<DeviceRecord> = self.devices.iter().map(|r| r.value().clone()).collect();
        let bytes = bincode::serialize(&records)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn record<T>(
        &self,
        handle: &DeviceHandle,
        f: impl FnOnce(&DeviceRecord) -> T,
    ) -> Result<T, RegistryError> {
        self.devices
            .get(&handle.key())
            .map(|r| f(r.value()))
            .ok_or_else(|| RegistryError::NotFound(handle.key()))
    }

    /// Reserve a random id no other device has.
    fn reserve_id(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(10_000_000u32..100_000_000).to_string();
            if self.ids.insert(id.clone()) {
                return id;
            }
        }
    }
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn resolve_or_create(
        &self,
        identity: &str,
        prefix: &str,
    ) -> Result<DeviceHandle, RegistryError> {
        let key = device_key(prefix, identity);
        if let Some(record) = self.devices.get(&key) {
            return Ok(record.handle());
        }
        let id = self.reserve_id();
        let handle = self
            .devices
            .entry(key)
            .or_insert_with(|| DeviceRecord::new(id.clone(), identity, prefix))
            .handle();
        if handle.id != id {
            // Lost the race to a concurrent creation of the same device.
            self.ids.remove(&id);
        }
        Ok(handle)
    }

    async fn set_battery(&self, handle: &DeviceHandle, level: u8) -> Result<(), RegistryError> {
        let mut record = self
            .devices
            .get_mut(&handle.key())
            .ok_or_else(|| RegistryError::NotFound(handle.key()))?;
        record.battery = Some(level);
        Ok(())
    }

    async fn get_last_fix(&self, handle: &DeviceHandle) -> Result<Option<Fix>, RegistryError> {
        self.record(handle, |r| r.track.last_fix)
    }

    async fn get_encoded_track(&self, handle: &DeviceHandle) -> Result<String, RegistryError> {
        self.record(handle, |r| r.track.encoded.clone())
    }

    async fn snapshot(&self, handle: &DeviceHandle) -> Result<DeviceRecord, RegistryError> {
        self.record(handle, DeviceRecord::clone)
    }

    async fn save(
        &self,
        handle: &DeviceHandle,
        track: &TrackState,
        battery: Option<u8>,
        expected_version: u64,
    ) -> Result<u64, RegistryError> {
        let mut record = self
            .devices
            .get_mut(&handle.key())
            .ok_or_else(|| RegistryError::NotFound(handle.key()))?;
        if record.version != expected_version {
            return Err(RegistryError::Conflict {
                device: handle.id.clone(),
                expected: expected_version,
                actual: record.version,
            });
        }
        record.track = track.clone();
        if battery.is_some() {
            record.battery = battery;
        }
        record.version += 1;
        Ok(record.version)
    }
}
