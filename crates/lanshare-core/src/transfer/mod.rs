//! Transfer sessions.
//!
//! A session moves a list of files between two devices. Per file, the
//! metadata connection carries the file header, the receiver's `READY`
//! line, and the port negotiation; the chunks then cross on their own
//! connections in parallel, capped by a semaphore on both sides. A final
//! connection carrying the termination marker ends the session, and the
//! receiver treats anything short of that marker as an incomplete session.
//!
//! Progress is derived from completed-chunk counts, never raw byte counts.

pub mod chunk;

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::plan::plan_chunks;
use crate::ports;
use crate::protocol::{self, format_size, FileHeader, READY};

/// Capacity of the event channel handed to the collaborator.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What a session reports to its collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Human-readable progress narration
    Status(String),
    /// Chunk-level progress for the file in flight
    Progress {
        /// File the progress applies to
        file_name: String,
        /// Completed chunks over total chunks, as a percentage
        percent: u8,
        /// Whole-session progress across all files
        overall: u8,
    },
    /// The session failed; terminal
    Failed(String),
    /// The session finished; terminal
    Completed,
}

/// Event-channel wrapper; progress events are dropped rather than letting
/// a slow collaborator stall the transfer.
#[derive(Clone)]
struct EventSink {
    tx: mpsc::Sender<TransferEvent>,
}

impl EventSink {
    async fn status(&self, message: String) {
        debug!(status = %message);
        let _ = self.tx.send(TransferEvent::Status(message)).await;
    }

    fn progress(&self, file_name: &str, percent: u8, overall: u8) {
        let _ = self.tx.try_send(TransferEvent::Progress {
            file_name: file_name.to_string(),
            percent,
            overall,
        });
    }

    async fn finish(&self, result: &Result<()>) {
        let event = match result {
            Ok(()) => TransferEvent::Completed,
            Err(e) => TransferEvent::Failed(e.to_string()),
        };
        let _ = self.tx.send(event).await;
    }
}

#[allow(clippy::cast_possible_truncation)]
fn percent(completed: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    ((u64::from(completed) * 100) / u64::from(total)) as u8
}

#[allow(clippy::cast_possible_truncation)]
fn overall_percent(file_index: usize, file_percent: u8, total_files: usize) -> u8 {
    if total_files == 0 {
        return 100;
    }
    ((file_index * 100 + file_percent as usize) / total_files) as u8
}

/// Send `files` to the peer at `peer_addr`, reporting through `events`.
///
/// Emits a terminal `Completed` or `Failed` event before returning.
pub async fn send_files(
    peer_addr: IpAddr,
    config: Config,
    files: Vec<PathBuf>,
    events: mpsc::Sender<TransferEvent>,
    cancel: CancellationToken,
) {
    let sink = EventSink { tx: events };
    let result = run_send_session(peer_addr, &config, &files, &sink, &cancel).await;
    if let Err(e) = &result {
        warn!(error = %e, "send session failed");
    }
    sink.finish(&result).await;
}

async fn run_send_session(
    peer_addr: IpAddr,
    config: &Config,
    files: &[PathBuf],
    sink: &EventSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let target = SocketAddr::new(peer_addr, config.network.transfer_port);
    let total_files = files.len();

    for (file_index, path) in files.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        send_one_file(target, config, path, file_index, total_files, sink, cancel).await?;
    }

    sink.status("Sending termination signal".to_string()).await;
    let stream = timeout(config.transfer.io_timeout(), TcpStream::connect(target))
        .await
        .map_err(|_| Error::ConnectionLost(target))??;
    let mut stream = BufStream::new(stream);
    protocol::write_termination(&mut stream).await?;

    info!(peer = %target, total_files, "send session completed");
    Ok(())
}

async fn send_one_file(
    target: SocketAddr,
    config: &Config,
    path: &Path,
    file_index: usize,
    total_files: usize,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidFileName(path.display().to_string()))?;
    protocol::validate_file_name(&name)?;

    let size = tokio::fs::metadata(path).await?.len();
    if size == 0 {
        return Err(Error::InvalidFileSize(0));
    }

    let plan = plan_chunks(
        size,
        config.transfer.base_chunk_size,
        config.transfer.max_chunk_size,
    );
    let total_chunks = plan.total_chunks();

    sink.status(format!(
        "Connecting to receiver at {} for {name} ({})",
        target.ip(),
        format_size(size)
    ))
    .await;

    let stream = timeout(config.transfer.io_timeout(), TcpStream::connect(target))
        .await
        .map_err(|_| Error::ConnectionLost(target))??;
    let mut stream = BufStream::new(stream);

    sink.status(format!("Dividing {name} into {total_chunks} chunks"))
        .await;
    let header = FileHeader {
        size,
        total_chunks,
        name: name.clone(),
    };
    protocol::write_file_header(&mut stream, &header).await?;

    let response = timeout(
        config.transfer.io_timeout(),
        protocol::read_line(&mut stream),
    )
    .await
    .map_err(|_| Error::Timeout(config.transfer.io_timeout_secs))??;
    if response != READY {
        return Err(Error::ReceiverNotReady(response));
    }

    let port_map =
        ports::propose_ports(&mut stream, total_chunks, config.network.transfer_port).await?;

    sink.status(format!("Receiver ready, starting transfer of {name}"))
        .await;
    let file_cancel = cancel.child_token();
    let semaphore = Arc::new(Semaphore::new(config.transfer.parallel_chunks));
    let completed = Arc::new(AtomicU32::new(0));
    let mut workers = JoinSet::new();

    for spec in &plan.chunks {
        let permit = tokio::select! {
            () = file_cancel.cancelled() => return Err(Error::Cancelled),
            permit = Arc::clone(&semaphore).acquire_owned() => {
                permit.map_err(|_| Error::Internal("chunk semaphore closed".to_string()))?
            }
        };

        let spec = *spec;
        let port = *port_map.get(&spec.index).ok_or_else(|| {
            Error::PortNegotiationFailed(format!("no port for chunk {}", spec.index))
        })?;
        let addr = SocketAddr::new(target.ip(), port);
        let path = path.to_path_buf();
        let transfer_config = config.transfer.clone();
        let worker_cancel = file_cancel.clone();
        let completed = Arc::clone(&completed);
        let sink = sink.clone();
        let file_name = name.clone();

        workers.spawn(async move {
            let _permit = permit;
            chunk::send_chunk(
                addr,
                spec,
                total_chunks,
                &path,
                &transfer_config,
                &worker_cancel,
            )
            .await?;
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            let file_percent = percent(done, total_chunks);
            sink.progress(
                &file_name,
                file_percent,
                overall_percent(file_index, file_percent, total_files),
            );
            Ok::<(), Error>(())
        });
    }

    while let Some(joined) = workers.join_next().await {
        let result = joined.map_err(|e| Error::Internal(format!("chunk task panicked: {e}")))?;
        if let Err(e) = result {
            file_cancel.cancel();
            workers.shutdown().await;
            return Err(e);
        }
    }

    sink.status(format!("Sent {name}")).await;
    Ok(())
}

/// Accept transfer sessions on the configured port until cancelled,
/// saving files under `save_dir` and reporting through `events`.
///
/// Emits a terminal `Completed` event after a full session (termination
/// marker seen) or `Failed` if the listener dies or a session aborts.
pub async fn receive_files(
    config: Config,
    save_dir: PathBuf,
    events: mpsc::Sender<TransferEvent>,
    cancel: CancellationToken,
) {
    let sink = EventSink { tx: events };
    let result = run_receive_session(&config, &save_dir, &sink, &cancel).await;
    if let Err(e) = &result {
        warn!(error = %e, "receive session failed");
    }
    sink.finish(&result).await;
}

async fn run_receive_session(
    config: &Config,
    save_dir: &Path,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::fs::create_dir_all(save_dir).await.map_err(|e| {
        Error::SaveDirectory(save_dir.display().to_string(), e.to_string())
    })?;

    let listener = TcpListener::bind(("0.0.0.0", config.network.transfer_port)).await?;
    info!(port = config.network.transfer_port, "waiting for incoming files");
    sink.status("Waiting for incoming files".to_string()).await;

    let mut files_received: usize = 0;
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            result = listener.accept() => result?,
        };
        let mut stream = BufStream::new(stream);

        let header = timeout(
            config.transfer.io_timeout(),
            protocol::read_file_header(&mut stream),
        )
        .await
        .map_err(|_| Error::Timeout(config.transfer.io_timeout_secs))??;

        let Some(header) = header else {
            info!(peer = %peer, files_received, "termination marker received");
            sink.status("Transfer complete".to_string()).await;
            return Ok(());
        };

        receive_one_file(config, save_dir, &mut stream, header, sink, cancel).await?;
        files_received += 1;
    }
}

async fn receive_one_file<S>(
    config: &Config,
    save_dir: &Path,
    stream: &mut S,
    header: FileHeader,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    header.validate()?;
    let total_chunks = header.total_chunks;
    let name = header.name.clone();

    sink.status(format!(
        "Receiving {name} ({})",
        format_size(header.size)
    ))
    .await;

    let dest = protocol::unique_destination(save_dir, &name);
    let file = tokio::fs::File::create(&dest).await?;
    file.set_len(header.size).await?;
    drop(file);

    protocol::write_line(stream, READY).await?;
    let mut listeners = ports::answer_proposal(
        stream,
        total_chunks,
        config.network.dynamic_port_range,
    )
    .await?;

    let file_cancel = cancel.child_token();
    let semaphore = Arc::new(Semaphore::new(config.transfer.parallel_chunks));
    let completed = Arc::new(AtomicU32::new(0));
    let mut workers = JoinSet::new();

    // Cancellation between chunk dispatches must reach the partial-file
    // cleanup below, even if every worker spawned so far succeeded.
    let mut outcome = Ok(());
    for index in 0..total_chunks {
        if file_cancel.is_cancelled() {
            outcome = Err(Error::Cancelled);
            break;
        }
        let permit = tokio::select! {
            () = file_cancel.cancelled() => {
                outcome = Err(Error::Cancelled);
                break;
            }
            permit = Arc::clone(&semaphore).acquire_owned() => {
                permit.map_err(|_| Error::Internal("chunk semaphore closed".to_string()))?
            }
        };

        let listener = listeners
            .take(index)
            .ok_or_else(|| Error::Internal(format!("no listener for chunk {index}")))?;
        let dest = dest.clone();
        let transfer_config = config.transfer.clone();
        let worker_cancel = file_cancel.clone();
        let completed = Arc::clone(&completed);
        let sink = sink.clone();
        let file_name = name.clone();
        let file_size = header.size;

        workers.spawn(async move {
            let _permit = permit;
            chunk::receive_chunk(
                listener,
                index,
                total_chunks,
                file_size,
                &dest,
                &transfer_config,
                &worker_cancel,
            )
            .await?;
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            let file_percent = percent(done, total_chunks);
            sink.progress(&file_name, file_percent, file_percent);
            Ok::<(), Error>(())
        });
    }

    while let Some(joined) = workers.join_next().await {
        let result = joined.map_err(|e| Error::Internal(format!("chunk task panicked: {e}")))?;
        if let Err(e) = result {
            file_cancel.cancel();
            workers.shutdown().await;
            if outcome.is_ok() {
                outcome = Err(e);
            }
            break;
        }
    }

    if let Err(e) = outcome {
        // Incomplete files are not kept.
        if let Err(remove_error) = tokio::fs::remove_file(&dest).await {
            warn!(path = %dest.display(), error = %remove_error, "could not remove partial file");
        }
        return Err(e);
    }

    sink.status(format!("Saved {name} to {}", dest.display())).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ChunkPlan;

    #[test]
    fn percent_rounds_down() {
        assert_eq!(percent(0, 3), 0);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 66);
        assert_eq!(percent(3, 3), 100);
    }

    #[test]
    fn overall_spans_files() {
        // Second of four files at 50%.
        assert_eq!(overall_percent(1, 50, 4), 37);
        assert_eq!(overall_percent(0, 0, 4), 0);
        assert_eq!(overall_percent(3, 100, 4), 100);
        assert_eq!(overall_percent(0, 100, 1), 100);
    }

    #[test]
    fn chunk_plan_matches_header_fields() {
        let plan: ChunkPlan = plan_chunks(1000, 64, 256);
        let header = FileHeader {
            size: 1000,
            total_chunks: plan.total_chunks(),
            name: "x.bin".to_string(),
        };
        assert!(header.validate().is_ok());
        assert_eq!(plan.chunks.len() as u32, header.total_chunks);
    }
}
