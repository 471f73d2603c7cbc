//! Client for the legacy live-position relay. Owns one lazily connected TCP stream.

use std::time::Duration;

use gpstrack_core::{encode_relay, Fix};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

const ATTEMPTS: usize = 2;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay {addr} failed after {attempts} attempts: {source}")]
    Unreachable {
        addr: String,
        attempts: usize,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct RelayClient {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
}

impl RelayClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: Mutex::new(None),
        }
    }

    /// Send `fixes` under `identity`. Connects on first use, and after a failed write drops
    /// the stream and tries once more on a fresh connection.
    pub async fn send(&self, identity: &str, fixes: &[Fix]) -> Result<(), RelayError> {
        let payload = encode_relay(identity, fixes);
        if payload.is_empty() {
            return Ok(());
        }
        let mut stream = self.stream.lock().await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write(&mut stream, payload.as_bytes()).await {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= ATTEMPTS => {
                    return Err(RelayError::Unreachable {
                        addr: self.addr.clone(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => debug!(addr = %self.addr, error = %e, "relay write failed, reconnecting"),
            }
        }
    }

    async fn write(&self, slot: &mut Option<TcpStream>, payload: &[u8]) -> std::io::Result<()> {
        if slot.is_none() {
            let connect = TcpStream::connect(&self.addr);
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, connect)
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
            *slot = Some(stream);
        }
        let Some(stream) = slot.as_mut() else {
            return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "no relay stream"));
        };
        let result = async {
            stream.write_all(payload).await?;
            stream.flush().await
        }
        .await;
        if result.is_err() {
            *slot = None;
        }
        result
    }
}
