//! Bidirectional byte relay for established tunnels
//!
//! Once the client and the SOCKS5 tunnel are both connected the bridge stops
//! looking at the bytes. Each direction copies independently; the first one
//! to stop, for any reason, tears the whole pair down.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-direction copy buffer size.
pub const RELAY_BUFFER_SIZE: usize = 80 * 1024;

/// Reads allowed to complete back-to-back without the task parking before
/// it yields to the scheduler.
pub const SYNC_CONTINUATION_LIMIT: u32 = 256;

/// Bytes moved in each direction over the life of a tunnel
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

#[derive(Debug, Default)]
struct PairState {
    torn_down: AtomicBool,
    cancel: CancellationToken,
}

/// Handle to the termination record shared by both directions of a tunnel.
#[derive(Debug, Clone, Default)]
pub struct RelayPair {
    state: Arc<PairState>,
}

impl RelayPair {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop both directions. Only the first call has any effect; it returns
    /// `true`, every later or concurrent call returns `false`.
    pub fn teardown(&self) -> bool {
        if self
            .state
            .torn_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.state.cancel.cancel();
        true
    }

    pub fn is_torn_down(&self) -> bool {
        self.state.torn_down.load(Ordering::Acquire)
    }

    async fn cancelled(&self) {
        self.state.cancel.cancelled().await
    }
}

/// Relay bytes between `client` and `upstream` until either side closes or
/// fails, then shut both down.
///
/// The upstream-to-client direction runs on its own task.
pub async fn relay<C, U>(client: C, upstream: U) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let pair = RelayPair::new();
    let (client_reader, client_writer) = tokio::io::split(client);
    let (upstream_reader, upstream_writer) = tokio::io::split(upstream);

    let download = tokio::spawn(pump(
        upstream_reader,
        client_writer,
        pair.clone(),
        "upstream->client",
    ));

    let upload = pump(client_reader, upstream_writer, pair.clone(), "client->upstream").await;

    let download = download.await.unwrap_or_else(|e| {
        debug!("Relay task failed: {}", e);
        pair.teardown();
        0
    });

    RelayStats {
        client_to_upstream: upload,
        upstream_to_client: download,
    }
}

/// Copy one direction until EOF, an error, or the pair is torn down.
async fn pump<R, W>(mut reader: R, mut writer: W, pair: RelayPair, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    let mut continuations = 0u32;

    loop {
        let read = tokio::select! {
            biased;
            _ = pair.cancelled() => break,
            read = read_tracked(&mut reader, &mut buffer) => read,
        };

        let (n, immediate) = match read {
            Ok((0, _)) => {
                debug!("Relay {} reached EOF after {} bytes", direction, total);
                break;
            }
            Ok(read) => read,
            Err(e) => {
                debug!("Relay {} read error: {}", direction, e);
                break;
            }
        };

        if !immediate {
            continuations = 0;
        }

        let written = tokio::select! {
            biased;
            _ = pair.cancelled() => break,
            written = writer.write_all(&buffer[..n]) => written,
        };
        if let Err(e) = written {
            debug!("Relay {} write error: {}", direction, e);
            break;
        }
        total += n as u64;

        continuations += 1;
        if continuations == SYNC_CONTINUATION_LIMIT {
            continuations = 0;
            tokio::task::yield_now().await;
        }
    }

    if pair.teardown() {
        debug!("Relay {} tearing down tunnel", direction);
    }
    let _ = writer.shutdown().await;

    total
}

/// Read once into `buf`, also reporting whether the read finished on its
/// first poll (data was already waiting).
async fn read_tracked<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<(usize, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut first_poll = true;

    poll_fn(|cx| {
        let mut read_buf = ReadBuf::new(&mut buf[..]);
        match Pin::new(&mut *reader).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok((read_buf.filled().len(), first_poll))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                first_poll = false;
                Poll::Pending
            }
        }
    })
    .await
}
