//! Connection listener: one TCP accept loop per hardware family.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::session::{run_session, ConnectionError, SessionSettings};
use crate::store::TrackStore;

/// Pause after a failed accept (e.g. out of file descriptors) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections forever, each served by its own task.
pub async fn run(listener: TcpListener, settings: Arc<SessionSettings>, store: Arc<TrackStore>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let settings = settings.clone();
                let store = store.clone();
                let span = info_span!("conn", id = %Uuid::new_v4());
                let task = async move {
                    let peer = peer.to_string();
                    debug!(protocol = %settings.kind, peer = %peer, "connection accepted");
                    let _ = stream.set_nodelay(true);
                    match run_session(stream, &peer, &settings, &store).await {
                        Ok(()) => debug!(protocol = %settings.kind, peer = %peer, "connection closed"),
                        Err(ConnectionError::Protocol(e)) => {
                            warn!(protocol = %settings.kind, peer = %peer, error = %e, "frame decode failed, connection closed");
                        }
                        Err(ConnectionError::IdleTimeout(limit)) => {
                            info!(protocol = %settings.kind, peer = %peer, idle_secs = limit.as_secs(), "idle connection closed");
                        }
                        Err(e) => {
                            warn!(protocol = %settings.kind, peer = %peer, error = %e, "connection closed");
                        }
                    }
                };
                tokio::spawn(task.instrument(span));
            }
            Err(e) => {
                warn!(protocol = %settings.kind, error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
