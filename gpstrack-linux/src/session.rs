//! Per-connection driver: feeds socket bytes to a [`ProtocolSession`], writes its replies
//! and hands decoded fixes to the track store.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use gpstrack_core::{Event, Fix, ProtocolKind, ProtocolSession, SessionError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use crate::registry::DeviceHandle;
use crate::store::{StoreError, TrackStore};

const READ_CHUNK: usize = 4096;

/// Per-listener settings shared by its connections.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub kind: ProtocolKind,
    pub id_prefix: String,
    pub idle_timeout: Option<Duration>,
}

/// Why a connection ended early.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] SessionError),
    #[error("cannot resolve device {identity}: {source}")]
    Identification {
        identity: String,
        #[source]
        source: StoreError,
    },
    #[error("idle for {0:?}")]
    IdleTimeout(Duration),
}

/// Serve one connection until EOF or error. Store failures on append are logged and the
/// connection stays up; everything else closes it.
pub async fn run_session<S>(
    mut stream: S,
    peer: &str,
    settings: &SessionSettings,
    store: &TrackStore,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = ProtocolSession::new(settings.kind);
    let mut device: Option<DeviceHandle> = None;
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        while !buf.is_empty() {
            let now = chrono::Utc::now().timestamp();
            let Some(decoded) = session.on_bytes(&buf, now)? else {
                break;
            };
            buf.advance(decoded.consumed);
            let mut frame = Frame::default();
            for event in decoded.events {
                match event {
                    Event::Identify(identity) => {
                        let handle = store
                            .resolve(&identity, &settings.id_prefix)
                            .await
                            .map_err(|source| ConnectionError::Identification {
                                identity: identity.clone(),
                                source,
                            })?;
                        info!(protocol = %settings.kind, peer, imei = %identity, device = %handle.id, "device identified");
                        device = Some(handle);
                    }
                    Event::Fixes(fixes) => frame.fixes.extend(fixes),
                    Event::InvalidFix => debug!(protocol = %settings.kind, peer, "invalid GPS fix dropped"),
                    Event::Battery(level) => frame.battery = Some(level),
                    Event::Heartbeat => trace!(protocol = %settings.kind, peer, "heartbeat"),
                    Event::Reply(bytes) => frame.replies.push(bytes),
                    Event::Ignored(what) => debug!(protocol = %settings.kind, peer, what = %what, "frame ignored"),
                }
            }
            if let Some(handle) = &device {
                store_frame(store, handle, &frame, settings.kind).await;
            }
            for reply in &frame.replies {
                if let Err(e) = write_reply(&mut stream, reply).await {
                    warn!(protocol = %settings.kind, peer, error = %e, "ACK write failed");
                }
            }
            if decoded.consumed == 0 {
                break;
            }
        }

        buf.reserve(READ_CHUNK);
        let read = stream.read_buf(&mut buf);
        let n = match settings.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| ConnectionError::IdleTimeout(limit))??,
            None => read.await?,
        };
        if n == 0 {
            if !buf.is_empty() {
                debug!(protocol = %settings.kind, peer, pending = buf.len(), "partial frame discarded");
            }
            session.shutdown();
            return Ok(());
        }
    }
}

/// What one frame asked of the host.
#[derive(Debug, Default)]
struct Frame {
    fixes: Vec<Fix>,
    battery: Option<u8>,
    replies: Vec<Vec<u8>>,
}

async fn store_frame(store: &TrackStore, handle: &DeviceHandle, frame: &Frame, kind: ProtocolKind) {
    if frame.fixes.is_empty() && frame.battery.is_none() {
        return;
    }
    match store.append(handle, &frame.fixes, frame.battery).await {
        Ok(report) if report.added > 0 => {
            info!(protocol = %kind, device = %handle.id, count = report.added, "fixes written");
        }
        Ok(_) => {}
        Err(e) => {
            warn!(protocol = %kind, device = %handle.id, error = %e, "append failed");
        }
    }
}

async fn write_reply<S: AsyncWrite + Unpin>(stream: &mut S, reply: &[u8]) -> std::io::Result<()> {
    stream.write_all(reply).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gpstrack_core::{codec, FrameDecodeError};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::registry::{DeviceRegistry, MemoryRegistry};

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    const GT06_LOGIN: &str = "78780d01012345678901234500018cdd0d0a";
    const GT06_LOGIN_ACK: &str = "787805010001d9dc0d0a";
    /// 0x22 location, 2024-03-15 12:30:45, 60.5 N 24.25 E, serial 3.
    const GT06_LOCATION: &str = "7878172218030f0c1e2dc9067daea0029a0bd000144c0003df170d0a";
    /// Heartbeat with voltage level 4, serial 5.
    const GT06_HEARTBEAT: &str = "78780a13440404000100051cc20d0a";
    const GT06_HEARTBEAT_ACK: &str = "787805130005afd50d0a";

    fn settings(kind: ProtocolKind, prefix: &str) -> SessionSettings {
        SessionSettings {
            kind,
            id_prefix: prefix.into(),
            idle_timeout: None,
        }
    }

    fn spawn(
        settings: SessionSettings,
        store: Arc<TrackStore>,
    ) -> (DuplexStream, JoinHandle<Result<(), ConnectionError>>) {
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            run_session(server, "test", &settings, &store).await
        });
        (client, task)
    }

    async fn read_n(client: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        client.read_exact(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn gt06_login_location_heartbeat() {
        let registry = Arc::new(MemoryRegistry::new());
        let store = Arc::new(TrackStore::new(registry.clone(), 5));
        let (mut client, task) = spawn(settings(ProtocolKind::Gt06, "gt06-"), store);

        client.write_all(&hex(GT06_LOGIN)).await.unwrap();
        assert_eq!(read_n(&mut client, 10).await, hex(GT06_LOGIN_ACK));

        // Location split across writes, then a heartbeat in the same write as its tail.
        let location = hex(GT06_LOCATION);
        client.write_all(&location[..9]).await.unwrap();
        let mut rest = location[9..].to_vec();
        rest.extend(hex(GT06_HEARTBEAT));
        client.write_all(&rest).await.unwrap();
        assert_eq!(read_n(&mut client, 10).await, hex(GT06_HEARTBEAT_ACK));

        drop(client);
        task.await.unwrap().unwrap();

        let handle = registry
            .resolve_or_create("123456789012345", "gt06-")
            .await
            .unwrap();
        let record = registry.snapshot(&handle).await.unwrap();
        assert_eq!(
            codec::decode(&record.track.encoded).unwrap(),
            vec![Fix::new(1_710_505_845, 60.5, 24.25)]
        );
        assert_eq!(record.battery, Some(66));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn bad_checksum_closes_only_this_connection() {
        let registry = Arc::new(MemoryRegistry::new());
        let store = Arc::new(TrackStore::new(registry.clone(), 5));
        let (mut bad, bad_task) = spawn(settings(ProtocolKind::Gt06, ""), store.clone());
        let (mut good, good_task) = spawn(settings(ProtocolKind::Gt06, ""), store);

        let mut corrupt = hex(GT06_LOGIN);
        corrupt[14] ^= 0xff;
        bad.write_all(&corrupt).await.unwrap();
        let err = bad_task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(SessionError::Frame(FrameDecodeError::Checksum { .. }))
        ));
        assert!(registry.is_empty());

        good.write_all(&hex(GT06_LOGIN)).await.unwrap();
        assert_eq!(read_n(&mut good, 10).await, hex(GT06_LOGIN_ACK));
        drop(good);
        good_task.await.unwrap().unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn data_before_login_is_rejected() {
        let store = Arc::new(TrackStore::new(Arc::new(MemoryRegistry::new()), 5));
        let (mut client, task) = spawn(settings(ProtocolKind::Gt06, ""), store);
        client.write_all(&hex(GT06_LOCATION)).await.unwrap();
        assert!(matches!(
            task.await.unwrap(),
            Err(ConnectionError::Protocol(SessionError::NotIdentified))
        ));
    }

    #[tokio::test]
    async fn codec8_login_and_records() {
        let registry = Arc::new(MemoryRegistry::new());
        let store = Arc::new(TrackStore::new(registry.clone(), 5));
        let (mut client, task) = spawn(settings(ProtocolKind::Codec8, ""), store);

        let mut login = vec![0x00, 0x0f];
        login.extend_from_slice(b"356307042441013");
        client.write_all(&login).await.unwrap();
        assert_eq!(read_n(&mut client, 1).await, vec![0x01]);

        client
            .write_all(&hex(
                "000000000000003608010000016b40d8ea30010000000000000000000000000000000105021503010101425e0f01f10000601a014e0000000000000000010000c7cf",
            ))
            .await
            .unwrap();
        assert_eq!(read_n(&mut client, 4).await, vec![0, 0, 0, 1]);
        drop(client);
        task.await.unwrap().unwrap();

        let handle = registry
            .resolve_or_create("356307042441013", "")
            .await
            .unwrap();
        let record = registry.snapshot(&handle).await.unwrap();
        // The reference record has no satellites: nothing is stored.
        assert!(record.track.is_empty());
    }

    #[tokio::test]
    async fn text_protocol_line_by_line() {
        let registry = Arc::new(MemoryRegistry::new());
        let store = Arc::new(TrackStore::new(registry.clone(), 5));
        let (mut client, task) = spawn(settings(ProtocolKind::MicTrack, ""), store);
        client
            .write_all(b"MT;6;866425031361423;R0;10+240315123045+60.17083+-24.50833+2.14+69+7+3800+113\r\nMT;6;866425031361423;R0;10+240315123050+60.17084+-24.50834+2.14+69+7+3800+113\r\n")
            .await
            .unwrap();
        drop(client);
        task.await.unwrap().unwrap();

        let handle = registry
            .resolve_or_create("866425031361423", "")
            .await
            .unwrap();
        let record = registry.snapshot(&handle).await.unwrap();
        assert_eq!(record.track.count, 2);
        assert_eq!(record.battery, Some(50));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_are_closed() {
        let store = Arc::new(TrackStore::new(Arc::new(MemoryRegistry::new()), 5));
        let mut settings = settings(ProtocolKind::Gt06, "");
        settings.idle_timeout = Some(Duration::from_secs(60));
        let (_client, task) = spawn(settings, store);
        assert!(matches!(
            task.await.unwrap(),
            Err(ConnectionError::IdleTimeout(_))
        ));
    }
}
