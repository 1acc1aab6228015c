//! Pipe - bidirectional relay with shared cancellation
//!
//! Both directions of a relayed pair share one `CancellationToken`. EOF or
//! an error on either side cancels it, which stops the other direction and
//! shuts down both writers. Reads are polled in bounded slices so a pair
//! that has gone quiet in both directions is torn down after the idle
//! timeout instead of parking a task forever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::stream::Stream;

/// Default buffer size for relay operations (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound for a single blocking read before idleness is re-checked
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Time allowed for a writer to flush its shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Last-activity clock shared by both relay directions
struct Activity {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

/// Relay data between two streams until either side closes.
///
/// Returns `(uploaded, downloaded)` byte counts. `on_traffic` is called for
/// every chunk forwarded in either direction.
pub async fn relay(
    inbound: Stream,
    outbound: Stream,
    cancel: CancellationToken,
    idle_timeout: Duration,
    on_traffic: &(dyn Fn(u64) + Sync),
) -> (u64, u64) {
    let (mut in_read, mut in_write) = tokio::io::split(inbound);
    let (mut out_read, mut out_write) = tokio::io::split(outbound);
    let activity = Activity::new();

    let upload = forward(
        &mut in_read,
        &mut out_write,
        &cancel,
        &activity,
        idle_timeout,
        on_traffic,
    );
    let download = forward(
        &mut out_read,
        &mut in_write,
        &cancel,
        &activity,
        idle_timeout,
        on_traffic,
    );

    tokio::join!(upload, download)
}

/// Copy one direction until EOF, error, idle timeout or cancellation
async fn forward<R, W>(
    reader: &mut R,
    writer: &mut W,
    cancel: &CancellationToken,
    activity: &Activity,
    idle_timeout: Duration,
    on_traffic: &(dyn Fn(u64) + Sync),
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = BytesMut::zeroed(RELAY_BUFFER_SIZE);
    let poll = POLL_INTERVAL.min(idle_timeout);

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(poll, reader.read(&mut buf)) => r,
        };

        let n = match read {
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Ok(Ok(n)) => n,
            Err(_) => {
                if activity.idle_for() >= idle_timeout {
                    break;
                }
                continue;
            }
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(idle_timeout, async {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await
            }) => r,
        };
        if !matches!(written, Ok(Ok(()))) {
            break;
        }

        activity.touch();
        total += n as u64;
        on_traffic(n as u64);
    }

    // Either side stopping ends the whole pair
    cancel.cancel();
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;
    total
}
