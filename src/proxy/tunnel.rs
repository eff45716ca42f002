//! CONNECT tunnel implementation
//!
//! Relays bytes between the client and the upstream connection without
//! looking at them.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, instrument};

use crate::error::Result;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Tunnel timing configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// The tunnel is closed once neither direction moved bytes for this long
    pub idle_timeout: Duration,
    /// How long the other direction may keep going once one side closed
    pub linger: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            linger: Duration::from_secs(2),
        }
    }
}

/// Handles CONNECT tunnels
pub struct TunnelHandler;

impl TunnelHandler {
    /// Copy data bidirectionally between two streams
    ///
    /// When one direction finishes, the write half of the opposite peer is
    /// shut down and the remaining direction gets `linger` to drain before
    /// both streams are dropped.
    #[instrument(skip_all)]
    pub async fn copy_bidirectional<C, S>(
        client: C,
        server: S,
        config: &TunnelConfig,
    ) -> Result<(u64, u64)>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);
        let activity = Activity::new();

        let client_to_server = async {
            let result = copy_with_idle_timeout(
                &mut client_read,
                &mut server_write,
                &activity,
                config.idle_timeout,
            )
            .await;
            let _ = server_write.shutdown().await;
            result
        };

        let server_to_client = async {
            let result = copy_with_idle_timeout(
                &mut server_read,
                &mut client_write,
                &activity,
                config.idle_timeout,
            )
            .await;
            let _ = client_write.shutdown().await;
            result
        };

        tokio::pin!(client_to_server);
        tokio::pin!(server_to_client);

        let (client_to_server_result, server_to_client_result) = tokio::select! {
            sent = &mut client_to_server => {
                (sent, linger(config.linger, &mut server_to_client).await)
            }
            received = &mut server_to_client => {
                (linger(config.linger, &mut client_to_server).await, received)
            }
        };

        let bytes_sent = client_to_server_result.unwrap_or_else(|e| {
            debug!("Client to server copy ended: {}", e);
            0
        });

        let bytes_received = server_to_client_result.unwrap_or_else(|e| {
            debug!("Server to client copy ended: {}", e);
            0
        });

        debug!(
            bytes_sent = bytes_sent,
            bytes_received = bytes_received,
            "Tunnel closed"
        );

        Ok((bytes_sent, bytes_received))
    }
}

async fn linger<F>(limit: Duration, direction: F) -> io::Result<u64>
where
    F: std::future::Future<Output = io::Result<u64>>,
{
    match timeout(limit, direction).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "peer closed, remaining direction cut off",
        )),
    }
}

/// Last time either direction of a tunnel moved bytes
struct Activity {
    start: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_deadline(&self, idle: Duration) -> Instant {
        self.start + Duration::from_millis(self.last_millis.load(Ordering::Relaxed)) + idle
    }
}

async fn copy_with_idle_timeout<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: &Activity,
    idle: Duration,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        // Only give up once the whole tunnel has been quiet for `idle`
        let n = loop {
            let deadline = activity.idle_deadline(idle);
            match timeout_at(deadline, reader.read(&mut buf)).await {
                Ok(read) => break read?,
                Err(_) if activity.idle_deadline(idle) > Instant::now() => continue,
                Err(_) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "tunnel idle timeout"))
                }
            }
        };
        if n == 0 {
            return Ok(total);
        }
        activity.touch();

        timeout(idle, writer.write_all(&buf[..n]))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tunnel write stalled"))??;
        activity.touch();
        total += n as u64;
    }
}
