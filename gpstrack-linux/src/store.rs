//! Track store: the single mutating entry point for device tracks.
//!
//! Appends for one device are serialized by a per-device async mutex; the registry's
//! version check catches writers outside this process, and the merge is retried on conflict.
//! After a write the store signals the touched window and relays the new fixes when the
//! device asks for it.

use std::sync::Arc;

use dashmap::DashMap;
use gpstrack_core::{codec, merge, relay_identity, CodecError, Fix, Merge, MergeMode, TrackState};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::registry::{DeviceHandle, DeviceRecord, DeviceRegistry, RegistryError};
use crate::relay::RelayClient;

/// Cache-invalidation signal for consumers of stored tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackExtended {
    pub device: String,
    pub min_ts: i64,
    pub max_ts: i64,
    /// Digest of the encoded track after the write, usable as an ETag.
    pub digest: String,
}

pub trait TrackObserver: Send + Sync {
    /// Fire-and-forget; must not block.
    fn on_track_extended(&self, event: &TrackExtended);
}

/// Default observer: logs the signal.
#[derive(Debug, Default)]
pub struct LogObserver;

impl TrackObserver for LogObserver {
    fn on_track_extended(&self, event: &TrackExtended) {
        debug!(
            device = %event.device,
            min_ts = event.min_ts,
            max_ts = event.max_ts,
            digest = %event.digest,
            "track extended"
        );
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("stored track is corrupt: {0}")]
    Codec(#[from] CodecError),
    #[error("device {device}: gave up after {attempts} conflicting writes")]
    RetriesExhausted { device: String, attempts: usize },
}

/// What an append did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendReport {
    pub added: usize,
    pub rejected: usize,
    pub rewritten: bool,
    /// Fix count after the write.
    pub count: usize,
}

impl AppendReport {
    fn of(merged: &Merge) -> Self {
        Self {
            added: merged.added.len(),
            rejected: merged.rejected,
            rewritten: merged.rewritten,
            count: merged.track.count,
        }
    }
}

pub struct TrackStore {
    registry: Arc<dyn DeviceRegistry>,
    observer: Arc<dyn TrackObserver>,
    relay: Option<Arc<RelayClient>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    max_retries: usize,
}

impl TrackStore {
    pub fn new(registry: Arc<dyn DeviceRegistry>, max_retries: usize) -> Self {
        Self {
            registry,
            observer: Arc::new(LogObserver),
            relay: None,
            locks: DashMap::new(),
            max_retries,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TrackObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_relay(mut self, relay: Arc<RelayClient>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub async fn resolve(&self, identity: &str, prefix: &str) -> Result<DeviceHandle, StoreError> {
        Ok(self.registry.resolve_or_create(identity, prefix).await?)
    }

    /// Merge `fixes` into the device's track and store `battery` alongside. Invalid fixes
    /// are dropped; an empty or fully rejected batch still records the battery level.
    pub async fn append(
        &self,
        handle: &DeviceHandle,
        fixes: &[Fix],
        battery: Option<u8>,
    ) -> Result<AppendReport, StoreError> {
        self.apply(handle, battery, |track| merge(track, fixes, MergeMode::Append))
            .await
    }

    /// Replace the whole track with `fixes`.
    pub async fn reset(
        &self,
        handle: &DeviceHandle,
        fixes: &[Fix],
    ) -> Result<AppendReport, StoreError> {
        self.apply(handle, None, |track| merge(track, fixes, MergeMode::Reset))
            .await
    }

    /// Drop every fix outside the union of `periods`.
    pub async fn retain_periods(
        &self,
        handle: &DeviceHandle,
        periods: &[(i64, i64)],
    ) -> Result<AppendReport, StoreError> {
        self.apply(handle, None, |track| {
            gpstrack_core::retain_periods(track, periods)
        })
        .await
    }

    async fn apply<F>(
        &self,
        handle: &DeviceHandle,
        battery: Option<u8>,
        plan: F,
    ) -> Result<AppendReport, StoreError>
    where
        F: Fn(&TrackState) -> Result<Merge, CodecError> + Send + Sync,
    {
        let key = handle.key();
        let lock = self.lock_for(&key);
        let written = {
            let _guard = lock.lock().await;
            self.write(handle, battery, &plan).await
        };
        self.release(&key, lock);
        let (record, merged) = written?;

        let report = AppendReport::of(&merged);
        if merged.is_noop() {
            return Ok(report);
        }
        if merged.rejected > 0 {
            debug!(device = %handle.id, rejected = merged.rejected, "invalid fixes dropped");
        }
        if let Some((min_ts, max_ts)) = merged.window() {
            self.observer.on_track_extended(&TrackExtended {
                device: handle.id.clone(),
                min_ts,
                max_ts,
                digest: codec::digest(&merged.track.encoded),
            });
        }
        self.relay(&record, &merged.added).await;
        if merged.rewritten {
            info!(device = %handle.id, count = report.count, "track rewritten");
        }
        Ok(report)
    }

    async fn relay(&self, record: &DeviceRecord, added: &[Fix]) {
        let Some(relay) = &self.relay else {
            return;
        };
        if added.is_empty() || !record.should_relay(chrono::Utc::now().timestamp()) {
            return;
        }
        if let Err(e) = relay.send(&relay_identity(&record.id), added).await {
            warn!(device = %record.id, error = %e, "relay failed");
        }
    }

    /// Snapshot, plan and save until the version check passes. Runs under the device lock.
    async fn write<F>(
        &self,
        handle: &DeviceHandle,
        battery: Option<u8>,
        plan: &F,
    ) -> Result<(DeviceRecord, Merge), StoreError>
    where
        F: Fn(&TrackState) -> Result<Merge, CodecError> + Send + Sync,
    {
        let mut conflicts = 0;
        loop {
            let record = self.registry.snapshot(handle).await?;
            let merged = plan(&record.track)?;
            if merged.is_noop() {
                if let Some(level) = battery {
                    self.registry.set_battery(handle, level).await?;
                }
                return Ok((record, merged));
            }
            match self
                .registry
                .save(handle, &merged.track, battery, record.version)
                .await
            {
                Ok(_) => return Ok((record, merged)),
                Err(RegistryError::Conflict { .. }) if conflicts < self.max_retries => {
                    conflicts += 1;
                    debug!(device = %handle.id, attempt = conflicts, "write conflict, retrying merge");
                }
                Err(RegistryError::Conflict { .. }) => {
                    return Err(StoreError::RetriesExhausted {
                        device: handle.id.clone(),
                        attempts: conflicts + 1,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the device's lock once no other task holds or waits on it.
    fn release(&self, key: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::registry::MemoryRegistry;

    const IMEI: &str = "359853000144328";

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<TrackExtended>>);

    impl TrackObserver for Recorder {
        fn on_track_extended(&self, event: &TrackExtended) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn fix(ts: i64) -> Fix {
        Fix::new(ts, 60.0 + ts as f64 * 1e-5, 24.0 - ts as f64 * 1e-5)
            .validated()
            .unwrap()
    }

    async fn setup() -> (Arc<MemoryRegistry>, TrackStore, DeviceHandle) {
        let registry = Arc::new(MemoryRegistry::new());
        let store = TrackStore::new(registry.clone(), 5);
        let handle = store.resolve(IMEI, "").await.unwrap();
        (registry, store, handle)
    }

    async fn stored(registry: &MemoryRegistry, handle: &DeviceHandle) -> Vec<Fix> {
        let encoded = registry.get_encoded_track(handle).await.unwrap();
        codec::decode(&encoded).unwrap()
    }

    #[tokio::test]
    async fn fresh_appends_extend_bytewise() {
        let (registry, store, handle) = setup().await;
        store.append(&handle, &[fix(1000), fix(1005)], None).await.unwrap();
        let before = registry.get_encoded_track(&handle).await.unwrap();

        let report = store.append(&handle, &[fix(1010)], Some(55)).await.unwrap();
        assert_eq!(report.added, 1);
        assert!(!report.rewritten);
        assert_eq!(report.count, 3);

        let after = registry.get_encoded_track(&handle).await.unwrap();
        assert!(after.starts_with(&before));
        let record = registry.snapshot(&handle).await.unwrap();
        assert_eq!(record.track.last_fix, Some(fix(1010)));
        assert_eq!(record.battery, Some(55));
    }

    #[tokio::test]
    async fn historical_fix_inserted_in_order() {
        let (registry, store, handle) = setup().await;
        store.append(&handle, &[fix(1000), fix(1010)], None).await.unwrap();
        let report = store
            .append(&handle, &[fix(1005), fix(1000), fix(1020)], None)
            .await
            .unwrap();
        assert_eq!(report.added, 2);
        assert!(report.rewritten);
        assert_eq!(
            stored(&registry, &handle).await,
            vec![fix(1000), fix(1005), fix(1010), fix(1020)]
        );
        let record = registry.snapshot(&handle).await.unwrap();
        assert_eq!(record.track.count, 4);
        assert_eq!(record.track.last_fix, Some(fix(1020)));
    }

    #[tokio::test]
    async fn appending_twice_is_idempotent() {
        let (registry, store, handle) = setup().await;
        let batch = [fix(1000), fix(1005), fix(1010)];
        store.append(&handle, &batch, None).await.unwrap();
        let once = registry.snapshot(&handle).await.unwrap();

        let report = store.append(&handle, &batch, None).await.unwrap();
        assert_eq!(report.added, 0);
        let twice = registry.snapshot(&handle).await.unwrap();
        assert_eq!(twice.track, once.track);
        assert_eq!(twice.version, once.version);
    }

    #[tokio::test]
    async fn rejected_batch_still_records_battery() {
        let (registry, store, handle) = setup().await;
        let report = store
            .append(&handle, &[Fix::new(1000, 91.0, 0.0), Fix::new(-5, 0.0, 0.0)], Some(12))
            .await
            .unwrap();
        assert_eq!(report.added, 0);
        assert_eq!(report.rejected, 2);
        let record = registry.snapshot(&handle).await.unwrap();
        assert!(record.track.is_empty());
        assert_eq!(record.battery, Some(12));
        assert_eq!(record.version, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn devices_do_not_interfere() {
        let registry = Arc::new(MemoryRegistry::new());
        let store = Arc::new(TrackStore::new(registry.clone(), 5));
        let a = store.resolve("359853000144328", "").await.unwrap();
        let b = store.resolve("866425031361423", "").await.unwrap();

        let mut tasks = Vec::new();
        for (handle, base) in [(a.clone(), 1_000), (b.clone(), 50_000)] {
            for chunk in 0..10 {
                let store = store.clone();
                let handle = handle.clone();
                tasks.push(tokio::spawn(async move {
                    let batch: Vec<Fix> = (0..5).map(|i| fix(base + chunk * 5 + i)).collect();
                    store.append(&handle, &batch, None).await.unwrap();
                }));
            }
        }
        for task in tasks {
            task.await.unwrap();
        }

        for (handle, base) in [(a, 1_000), (b, 50_000)] {
            let fixes = stored(&registry, &handle).await;
            let expected: Vec<Fix> = (0..50).map(|i| fix(base + i)).collect();
            assert_eq!(fixes, expected);
            assert_eq!(registry.snapshot(&handle).await.unwrap().track.count, 50);
        }
        assert!(store.locks.is_empty());
    }

    #[tokio::test]
    async fn device_lock_is_dropped_after_write() {
        let (_registry, store, handle) = setup().await;
        store.append(&handle, &[fix(1000)], None).await.unwrap();
        assert!(store.locks.is_empty());

        // A waiter keeps the entry alive until it is done too.
        let held = store.lock_for(&handle.key());
        store.append(&handle, &[fix(1005)], None).await.unwrap();
        assert_eq!(store.locks.len(), 1);
        store.release(&handle.key(), held);
        assert!(store.locks.is_empty());
    }

    /// Registry whose first `failures` saves report a concurrent writer.
    struct Flaky {
        inner: MemoryRegistry,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl DeviceRegistry for Flaky {
        async fn resolve_or_create(
            &self,
            identity: &str,
            prefix: &str,
        ) -> Result<DeviceHandle, RegistryError> {
            self.inner.resolve_or_create(identity, prefix).await
        }

        async fn set_battery(&self, handle: &DeviceHandle, level: u8) -> Result<(), RegistryError> {
            self.inner.set_battery(handle, level).await
        }

        async fn get_last_fix(&self, handle: &DeviceHandle) -> Result<Option<Fix>, RegistryError> {
            self.inner.get_last_fix(handle).await
        }

        async fn get_encoded_track(&self, handle: &DeviceHandle) -> Result<String, RegistryError> {
            self.inner.get_encoded_track(handle).await
        }

        async fn snapshot(&self, handle: &DeviceHandle) -> Result<DeviceRecord, RegistryError> {
            self.inner.snapshot(handle).await
        }

        async fn save(
            &self,
            handle: &DeviceHandle,
            track: &TrackState,
            battery: Option<u8>,
            expected_version: u64,
        ) -> Result<u64, RegistryError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                // Another writer slipped a fix in first.
                let mut record = self.inner.snapshot(handle).await?;
                let merged = merge(&record.track, &[fix(10_000 + left as i64)], MergeMode::Append)
                    .map_err(|_| RegistryError::NotFound(handle.key()))?;
                record.track = merged.track;
                self.inner
                    .save(handle, &record.track, None, record.version)
                    .await?;
            }
            self.inner.save(handle, track, battery, expected_version).await
        }
    }

    #[tokio::test]
    async fn conflicts_are_retried_without_losing_fixes() {
        let registry = Arc::new(Flaky {
            inner: MemoryRegistry::new(),
            failures: AtomicUsize::new(2),
        });
        let store = TrackStore::new(registry.clone(), 5);
        let handle = store.resolve(IMEI, "").await.unwrap();

        let report = store.append(&handle, &[fix(1000)], None).await.unwrap();
        assert_eq!(report.added, 1);
        let fixes = stored(&registry.inner, &handle).await;
        assert_eq!(fixes, vec![fix(1000), fix(10_001), fix(10_002)]);
    }

    #[tokio::test]
    async fn conflicts_exhaust_retries() {
        let registry = Arc::new(Flaky {
            inner: MemoryRegistry::new(),
            failures: AtomicUsize::new(10),
        });
        let store = TrackStore::new(registry, 2);
        let handle = store.resolve(IMEI, "").await.unwrap();
        let err = store.append(&handle, &[fix(1000)], None).await.unwrap_err();
        assert!(matches!(err, StoreError::RetriesExhausted { attempts: 3, .. }));
        assert!(store.locks.is_empty());
    }

    #[tokio::test]
    async fn observer_sees_touched_window() {
        let (_registry, store, handle) = setup().await;
        let recorder = Arc::new(Recorder::default());
        let store = store.with_observer(recorder.clone());

        store.append(&handle, &[fix(1000), fix(1010)], None).await.unwrap();
        store.append(&handle, &[fix(1005)], None).await.unwrap();
        store.append(&handle, &[fix(1005)], None).await.unwrap();

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!((seen[0].min_ts, seen[0].max_ts), (1000, 1010));
        assert_eq!((seen[1].min_ts, seen[1].max_ts), (1005, 1005));
        assert_ne!(seen[0].digest, seen[1].digest);
    }

    #[tokio::test]
    async fn reset_and_retain_periods() {
        let (registry, store, handle) = setup().await;
        store
            .append(&handle, &[fix(1000), fix(1005), fix(1010), fix(1015)], None)
            .await
            .unwrap();
        let report = store
            .retain_periods(&handle, &[(1004, 1011), (1010, 1012)])
            .await
            .unwrap();
        assert_eq!(report.count, 2);
        assert_eq!(stored(&registry, &handle).await, vec![fix(1005), fix(1010)]);

        let report = store.reset(&handle, &[fix(2000)]).await.unwrap();
        assert!(report.rewritten);
        assert_eq!(stored(&registry, &handle).await, vec![fix(2000)]);
    }

    #[tokio::test]
    async fn relays_only_flagged_devices() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = Arc::new(RelayClient::new(listener.local_addr().unwrap().to_string()));
        let registry = Arc::new(MemoryRegistry::new());
        let store = TrackStore::new(registry.clone(), 5).with_relay(relay.clone());
        let quiet = store.resolve("866425031361423", "").await.unwrap();
        let live = store.resolve(IMEI, "").await.unwrap();
        registry.set_relay_until(&live, Some(i64::MAX)).unwrap();

        store.append(&quiet, &[fix(1000)], None).await.unwrap();
        store
            .append(&live, &[Fix::new(1_136_073_700, 60.0, 24.0)], None)
            .await
            .unwrap();

        let (mut socket, _) = listener.accept().await.unwrap();
        let expected = format!("rc{}.100_1200000_6000000.\n", live.id);
        let mut received = vec![0u8; expected.len()];
        socket.read_exact(&mut received).await.unwrap();
        assert_eq!(String::from_utf8(received).unwrap(), expected);
    }

    #[tokio::test]
    async fn relay_failure_does_not_fail_append() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let registry = Arc::new(MemoryRegistry::new());
        let store =
            TrackStore::new(registry.clone(), 5).with_relay(Arc::new(RelayClient::new(addr.to_string())));
        let handle = store.resolve(IMEI, "").await.unwrap();
        registry.set_relay_until(&handle, Some(i64::MAX)).unwrap();

        let report = store.append(&handle, &[fix(1000)], None).await.unwrap();
        assert_eq!(report.added, 1);
    }
}
