//! TCP transport: one JSON document per line, one connection per request.

use async_trait::async_trait;
use hashweave_protocol::{Command, CommandResponse};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::TransportError;
use crate::transport::{Rpc, Transport};

/// Largest request or response line accepted, newline included
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub struct TcpTransport {
    advertise: String,
    consumer: Mutex<Option<mpsc::Receiver<Rpc>>>,
    timeout: Duration,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind `bind_addr` and start accepting connections.
    pub async fn bind(
        bind_addr: &str,
        advertise: Option<String>,
        max_pool: usize,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local = listener.local_addr()?;
        let advertise = advertise.unwrap_or_else(|| local.to_string());
        info!("🌐 TCP transport listening on {} (advertised as {})", local, advertise);

        let (tx, rx) = mpsc::channel(max_pool.max(1));
        let handle = tokio::spawn(accept_loop(listener, tx, timeout));

        Ok(Self {
            advertise,
            consumer: Mutex::new(Some(rx)),
            timeout,
            listener: Mutex::new(Some(handle)),
        })
    }

    async fn exchange(&self, target: &str, command: &Command) -> Result<CommandResponse, TransportError> {
        let mut stream = TcpStream::connect(target).await?;
        let mut line = serde_json::to_vec(command)?;
        line.push(b'\n');
        stream.write_all(&line).await?;

        let mut reader = BufReader::new(stream);
        let Some(reply) = read_frame(&mut reader, MAX_FRAME_BYTES).await? else {
            return Err(TransportError::Unreachable { addr: target.to_string() });
        };
        Ok(serde_json::from_slice(&reply)?)
    }
}

/// Read one newline-terminated frame of at most `limit` bytes. `None` at end
/// of stream.
async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    let read = (&mut *reader)
        .take(limit as u64 + 1)
        .read_until(b'\n', &mut frame)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if frame.len() > limit {
        return Err(TransportError::FrameTooLarge { limit });
    }
    Ok(Some(frame))
}

async fn accept_loop(listener: TcpListener, inbound: mpsc::Sender<Rpc>, timeout: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, inbound, timeout).await {
                        debug!("Connection from {} ended: {}", remote, e);
                    }
                });
            }
            Err(e) => warn!("⚠️ Accept failed: {}", e),
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    inbound: mpsc::Sender<Rpc>,
    timeout: Duration,
) -> Result<(), TransportError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    while let Some(line) = read_frame(&mut reader, MAX_FRAME_BYTES).await? {
        let response = match serde_json::from_slice::<Command>(&line) {
            Ok(command) => {
                let (rpc, reply) = Rpc::new(command);
                inbound.send(rpc).await.map_err(|_| TransportError::Closed)?;
                match tokio::time::timeout(timeout, reply).await {
                    Ok(Ok(response)) => response,
                    _ => CommandResponse::Error("request was not answered in time".to_string()),
                }
            }
            Err(e) => CommandResponse::Error(format!("malformed request: {}", e)),
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        write_half.write_all(&out).await?;
    }
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> String {
        self.advertise.clone()
    }

    async fn request(&self, target: &str, command: Command) -> Result<CommandResponse, TransportError> {
        match tokio::time::timeout(self.timeout, self.exchange(target, &command)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { addr: target.to_string() }),
        }
    }

    fn take_consumer(&self) -> Option<mpsc::Receiver<Rpc>> {
        self.consumer.lock().ok().and_then(|mut slot| slot.take())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let handle = self.listener.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
            info!("🛑 TCP transport on {} closed", self.advertise);
        }
        Ok(())
    }
}
