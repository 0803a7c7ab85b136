//! TCP front door: accepts bounded concurrent client sessions, accumulates
//! request bytes per session, and hands complete-enough buffers to the
//! bridge coordinator.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::coordinator::BridgeCoordinator;
use crate::tcp_codec::MIN_REQUEST_LEN;

const READ_CHUNK: usize = 512;

pub struct TcpFrontend {
    coordinator: Arc<Mutex<BridgeCoordinator>>,
    max_clients: usize,
    idle_timeout: Duration,
}

impl TcpFrontend {
    pub fn new(coordinator: Arc<Mutex<BridgeCoordinator>>, max_clients: usize, idle_timeout: Duration) -> Self {
        Self { coordinator, max_clients, idle_timeout }
    }

    /// Binds and serves forever. Session-level errors are logged and do not
    /// stop the listener; only a bind failure is returned to the caller.
    pub async fn run(self, bind_addr: SocketAddr) -> std::io::Result<()> {
        let listener = TokioTcpListener::bind(bind_addr).await?;
        info!(target: "inverter_bridge::listener", %bind_addr, "listening for clients");
        let permits = Arc::new(Semaphore::new(self.max_clients));

        loop {
            let (stream, remote) = listener.accept().await?;
            let Ok(permit) = permits.clone().try_acquire_owned() else {
                warn!(target: "inverter_bridge::listener", %remote, "max_clients reached, dropping connection");
                drop(stream);
                continue;
            };
            let coordinator = self.coordinator.clone();
            let idle_timeout = self.idle_timeout;
            tokio::spawn(async move {
                if let Err(e) = handle_session(stream, coordinator, idle_timeout).await {
                    debug!(target: "inverter_bridge::listener", %remote, error = %e, "session ended with error");
                }
                drop(permit);
            });
        }
    }
}

async fn handle_session(
    stream: TcpStream,
    coordinator: Arc<Mutex<BridgeCoordinator>>,
    idle_timeout: Duration,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = unbounded_channel::<Vec<u8>>();
    let mut buffer: Vec<u8> = Vec::new();
    let mut read_buf = [0u8; READ_CHUNK];

    loop {
        tokio::select! {
            biased;

            outgoing = rx.recv() => {
                match outgoing {
                    Some(bytes) => writer.write_all(&bytes).await?,
                    None => break,
                }
            }

            result = tokio::time::timeout(idle_timeout, reader.read(&mut read_buf)) => {
                let n = match result {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        debug!(target: "inverter_bridge::listener", "closing idle session");
                        break;
                    }
                };
                buffer.extend_from_slice(&read_buf[..n]);
                if buffer.len() >= MIN_REQUEST_LEN {
                    let mut coordinator = coordinator.lock().await;
                    coordinator.process_client_bytes(&buffer, tx.clone());
                    buffer.clear();
                }
            }
        }
    }
    Ok(())
}
