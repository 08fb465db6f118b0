//! Per-chunk transfer workers.
//!
//! Each chunk crosses the network on its own TCP connection. The sender
//! connects to the chunk's negotiated port, writes the chunk header and the
//! raw bytes; the receiver accepts, validates the header against its own
//! plan, and writes the bytes at the chunk's offset through its own file
//! handle. Chunk ranges are disjoint, so concurrent workers never need to
//! coordinate their writes.
//!
//! Failures are retried with exponential backoff. Stall detection is a
//! timeout around every buffer-sized socket operation; any progress resets
//! it.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::Path;

use socket2::SockRef;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::plan::ChunkSpec;
use crate::protocol::{self, ChunkHeader};

/// Copy buffer size for chunk bytes.
const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Socket send/receive buffer size requested for chunk connections.
const SOCKET_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Tune a chunk connection for bulk throughput.
fn tune_stream(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    // Best effort; the OS may clamp these.
    if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        trace!(error = %e, "could not grow send buffer");
    }
    if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        trace!(error = %e, "could not grow receive buffer");
    }
    Ok(())
}

fn stalled(index: u32, config: &TransferConfig) -> Error {
    Error::ChunkStalled {
        index,
        secs: config.stall_timeout_secs,
    }
}

async fn send_chunk_once(
    addr: SocketAddr,
    chunk: ChunkSpec,
    total_chunks: u32,
    path: &Path,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let stream = timeout(config.io_timeout(), TcpStream::connect(addr))
        .await
        .map_err(|_| Error::ConnectionLost(addr))??;
    tune_stream(&stream)?;
    let mut stream = stream;

    let header = ChunkHeader {
        index: chunk.index,
        start_offset: chunk.offset,
        length: u32::try_from(chunk.length).map_err(|_| Error::InvalidChunkHeader {
            index: chunk.index,
            reason: format!("chunk length out of range: {}", chunk.length),
        })?,
        total_chunks,
    };
    timeout(
        config.stall_timeout(),
        protocol::write_chunk_header(&mut stream, &header),
    )
    .await
    .map_err(|_| stalled(chunk.index, config))??;

    // Fresh handle per attempt; workers never share one.
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(chunk.offset)).await?;

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut remaining = chunk.length;
    while remaining > 0 {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let want = COPY_BUFFER_SIZE.min(usize::try_from(remaining).unwrap_or(COPY_BUFFER_SIZE));
        let read = file.read(&mut buf[..want]).await?;
        if read == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source file truncated with {remaining} bytes left"),
            )));
        }
        timeout(config.stall_timeout(), stream.write_all(&buf[..read]))
            .await
            .map_err(|_| stalled(chunk.index, config))??;
        remaining -= read as u64;
    }

    timeout(config.stall_timeout(), stream.flush())
        .await
        .map_err(|_| stalled(chunk.index, config))??;
    Ok(())
}

/// Send one chunk, retrying with exponential backoff on recoverable errors.
///
/// # Errors
///
/// Returns [`Error::ChunkFailed`] after the retry budget is spent,
/// [`Error::Cancelled`] if the token fires, or the first unrecoverable
/// error.
pub async fn send_chunk(
    addr: SocketAddr,
    chunk: ChunkSpec,
    total_chunks: u32,
    path: &Path,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut last_error = String::new();
    for attempt in 1..=config.chunk_retries {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match send_chunk_once(addr, chunk, total_chunks, path, config, cancel).await {
            Ok(()) => {
                debug!(index = chunk.index, attempt, "chunk sent");
                return Ok(());
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) if e.is_recoverable() => {
                warn!(index = chunk.index, attempt, error = %e, "chunk send failed, retrying");
                last_error = e.to_string();
                if attempt < config.chunk_retries {
                    let backoff = config.retry_backoff(attempt);
                    tokio::select! {
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::ChunkFailed {
        index: chunk.index,
        attempts: config.chunk_retries,
        reason: last_error,
    })
}

async fn receive_chunk_once(
    listener: &TcpListener,
    expected_index: u32,
    total_chunks: u32,
    file_size: u64,
    dest: &Path,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let (stream, peer) = tokio::select! {
        () = cancel.cancelled() => return Err(Error::Cancelled),
        result = timeout(config.stall_timeout(), listener.accept()) => {
            result.map_err(|_| stalled(expected_index, config))??
        }
    };
    tune_stream(&stream)?;
    let mut stream = stream;
    trace!(index = expected_index, peer = %peer, "chunk connection accepted");

    let header = timeout(
        config.io_timeout(),
        protocol::read_chunk_header(&mut stream),
    )
    .await
    .map_err(|_| stalled(expected_index, config))??;

    // The header carries the range; we only check it stays inside the file
    // announced by the metadata channel.
    let in_bounds = header
        .start_offset
        .checked_add(u64::from(header.length))
        .is_some_and(|end| end <= file_size);
    if header.index != expected_index
        || header.total_chunks != total_chunks
        || header.length == 0
        || !in_bounds
    {
        return Err(Error::InvalidChunkHeader {
            index: expected_index,
            reason: format!("header {header:?} invalid for a {file_size}-byte file"),
        });
    }

    // Own handle; the file was pre-sized when the header arrived.
    let mut file = OpenOptions::new().write(true).open(dest).await?;
    file.seek(SeekFrom::Start(header.start_offset)).await?;

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut remaining = u64::from(header.length);
    while remaining > 0 {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let want = COPY_BUFFER_SIZE.min(usize::try_from(remaining).unwrap_or(COPY_BUFFER_SIZE));
        let read = timeout(config.stall_timeout(), stream.read(&mut buf[..want]))
            .await
            .map_err(|_| stalled(expected_index, config))??;
        if read == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("chunk stream closed with {remaining} bytes left"),
            )));
        }
        file.write_all(&buf[..read]).await?;
        remaining -= read as u64;
    }

    file.flush().await?;
    Ok(())
}

/// Receive one chunk on its dedicated listener, retrying on recoverable
/// errors so a reconnecting sender finds the port still open.
///
/// # Errors
///
/// Returns [`Error::ChunkFailed`] after the retry budget is spent,
/// [`Error::Cancelled`] if the token fires, or the first unrecoverable
/// error.
pub async fn receive_chunk(
    listener: TcpListener,
    expected_index: u32,
    total_chunks: u32,
    file_size: u64,
    dest: &Path,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut last_error = String::new();
    for attempt in 1..=config.chunk_retries {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let result = receive_chunk_once(
            &listener,
            expected_index,
            total_chunks,
            file_size,
            dest,
            config,
            cancel,
        )
        .await;
        match result {
            Ok(()) => {
                debug!(index = expected_index, attempt, "chunk received");
                return Ok(());
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) if e.is_recoverable() => {
                warn!(
                    index = expected_index,
                    attempt,
                    error = %e,
                    "chunk receive failed, waiting for sender to retry"
                );
                last_error = e.to_string();
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::ChunkFailed {
        index: expected_index,
        attempts: config.chunk_retries,
        reason: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_config() -> TransferConfig {
        TransferConfig {
            retry_backoff_ms: 10,
            stall_timeout_secs: 2,
            io_timeout_secs: 2,
            ..TransferConfig::default()
        }
    }

    #[tokio::test]
    async fn chunk_roundtrip_at_offset() {
        let dir = TempDir::new().expect("temp dir");
        let source = dir.path().join("source.bin");
        let dest = dir.path().join("dest.bin");

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &payload).expect("write source");
        // Pre-size the destination the way the session does.
        let dest_file = std::fs::File::create(&dest).expect("create dest");
        dest_file
            .set_len(payload.len() as u64)
            .expect("pre-size dest");

        let chunk = ChunkSpec {
            index: 1,
            offset: 40_000,
            length: 30_000,
        };
        let config = fast_config();
        let cancel = CancellationToken::new();

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let recv_dest = dest.clone();
        let recv_config = config.clone();
        let recv_cancel = cancel.clone();
        let file_size = payload.len() as u64;
        let receiver = tokio::spawn(async move {
            receive_chunk(
                listener,
                1,
                3,
                file_size,
                &recv_dest,
                &recv_config,
                &recv_cancel,
            )
            .await
        });

        send_chunk(addr, chunk, 3, &source, &config, &cancel)
            .await
            .expect("send chunk");
        receiver.await.expect("join").expect("receive chunk");

        let written = std::fs::read(&dest).expect("read dest");
        assert_eq!(&written[40_000..70_000], &payload[40_000..70_000]);
        // Bytes outside the chunk range are untouched.
        assert!(written[..40_000].iter().all(|&b| b == 0));
        assert!(written[70_000..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn mismatched_header_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let dest = dir.path().join("dest.bin");
        std::fs::File::create(&dest)
            .expect("create dest")
            .set_len(1000)
            .expect("pre-size");

        let config = fast_config();
        let cancel = CancellationToken::new();

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let receiver = tokio::spawn({
            let dest = dest.clone();
            let config = config.clone();
            let cancel = cancel.clone();
            async move { receive_chunk(listener, 0, 1, 1000, &dest, &config, &cancel).await }
        });

        // Claim a range running past the announced file size.
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let bogus = ChunkHeader {
            index: 0,
            start_offset: 500,
            length: 1000,
            total_chunks: 1,
        };
        protocol::write_chunk_header(&mut stream, &bogus)
            .await
            .expect("write header");

        let result = receiver.await.expect("join");
        assert!(matches!(
            result,
            Err(Error::InvalidChunkHeader { index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn connect_failure_exhausts_retries() {
        let dir = TempDir::new().expect("temp dir");
        let source = dir.path().join("source.bin");
        std::fs::write(&source, vec![7u8; 100]).expect("write source");

        // Nothing listens here.
        let addr: SocketAddr = "127.0.0.1:47601".parse().expect("addr");
        let chunk = ChunkSpec {
            index: 0,
            offset: 0,
            length: 100,
        };
        let config = fast_config();
        let cancel = CancellationToken::new();

        let result = send_chunk(addr, chunk, 1, &source, &config, &cancel).await;
        assert!(
            matches!(result, Err(Error::ChunkFailed { index: 0, attempts, .. }) if attempts == config.chunk_retries)
        );
    }

    #[tokio::test]
    async fn cancellation_aborts_promptly() {
        let dir = TempDir::new().expect("temp dir");
        let source = dir.path().join("source.bin");
        std::fs::write(&source, vec![1u8; 100]).expect("write source");

        let addr: SocketAddr = "127.0.0.1:47602".parse().expect("addr");
        let chunk = ChunkSpec {
            index: 0,
            offset: 0,
            length: 100,
        };
        let config = fast_config();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = send_chunk(addr, chunk, 1, &source, &config, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
