//! Bidirectional byte relay between two connections.

use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Default copy buffer size per direction.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

// Upper bound on flushing a close to a peer that no longer reads.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Byte counts and the error (if any) that ended a bridged session.
#[derive(Debug, Default)]
pub struct BridgeStats {
    /// Bytes copied from the first stream to the second.
    pub a_to_b: u64,
    /// Bytes copied from the second stream to the first.
    pub b_to_a: u64,
    /// Error that terminated the first loop to finish. A clean EOF is not an error.
    pub first_error: Option<std::io::Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    AToB,
    BToA,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AToB => f.write_str("a->b"),
            Self::BToA => f.write_str("b->a"),
        }
    }
}

struct HalfOutcome {
    direction: Direction,
    bytes: u64,
    error: Option<std::io::Error>,
}

// First few bytes of a chunk as hex, for trace output.
struct Preview<'a>(&'a [u8]);

impl fmt::Display for Preview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter().take(10) {
            write!(f, "{b:02x}")?;
        }
        if self.0.len() > 10 {
            f.write_str("...")?;
        }
        Ok(())
    }
}

/// Copies bytes both ways between two streams until either side ends.
///
/// When one direction stops (EOF, read error or write error) both streams are
/// shut down at once instead of waiting for the other direction to drain, and
/// [`run`](Bridge::run) returns only after both copy loops have exited.
#[derive(Debug, Clone, Copy)]
pub struct Bridge {
    buffer_size: usize,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl Bridge {
    /// Bridge that reads up to `buffer_size` bytes per chunk.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    /// Relay between `a` and `b` until one side terminates.
    ///
    /// Both streams are consumed and closed. Dropping the returned future
    /// aborts the copy loops.
    pub async fn run<A, B>(&self, a: A, b: B) -> BridgeStats
    where
        A: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let shutdown = CancellationToken::new();

        let mut loops = JoinSet::new();
        loops.spawn(copy_half(
            a_read,
            b_write,
            shutdown.clone(),
            Direction::AToB,
            self.buffer_size,
        ));
        loops.spawn(copy_half(
            b_read,
            a_write,
            shutdown.clone(),
            Direction::BToA,
            self.buffer_size,
        ));

        let mut stats = BridgeStats::default();
        while let Some(res) = loops.join_next().await {
            match res {
                Ok(outcome) => {
                    match outcome.direction {
                        Direction::AToB => stats.a_to_b = outcome.bytes,
                        Direction::BToA => stats.b_to_a = outcome.bytes,
                    }
                    if stats.first_error.is_none() {
                        stats.first_error = outcome.error;
                    }
                }
                Err(e) => {
                    shutdown.cancel();
                    warn!("bridge copy task failed: {e}");
                }
            }
        }

        debug!(
            a_to_b = stats.a_to_b,
            b_to_a = stats.b_to_a,
            error = ?stats.first_error,
            "bridge finished"
        );
        stats
    }
}

async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    shutdown: CancellationToken,
    direction: Direction,
    buffer_size: usize,
) -> HalfOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut bytes = 0u64;
    let mut error = None;

    loop {
        let n = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = reader.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(%direction, "read failed: {e}");
                    error = Some(e);
                    break;
                }
            },
        };
        trace!(%direction, bytes = n, preview = %Preview(&buf[..n]), "relaying chunk");

        let write = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = write => if let Err(e) = res {
                debug!(%direction, "write failed: {e}");
                error = Some(e);
                break;
            },
        }
        bytes += n as u64;
    }

    // Tell the other loop to stop, then close our outgoing side.
    shutdown.cancel();
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;

    HalfOutcome {
        direction,
        bytes,
        error,
    }
}
