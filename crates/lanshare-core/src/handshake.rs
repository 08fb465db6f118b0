//! Consent handshake.
//!
//! Before any file data moves, the sender asks permission over a dedicated
//! line-oriented connection and the receiver answers `YES` or `NO`. The
//! answer normally comes from a human, so the sender waits far longer for
//! it than it would for any other response.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{self, format_size, HANDSHAKE_ACCEPT, HANDSHAKE_REJECT};

/// Callback deciding whether to accept an incoming transfer request.
///
/// Receives the request line as shown to the user and returns `true` to
/// accept. It is called on the listener task, so long-running UI prompts
/// should resolve through a channel rather than block here.
pub type AcceptDecision = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Build the human-readable request line for a set of files.
///
/// Single file: `"<name> wants to send you: report.pdf (1.2 MB)"`.
/// Multiple: `"<name> wants to send you: 3 files (450.0 MB)"`.
#[must_use]
pub fn request_line(local_name: &str, files: &[PathBuf]) -> String {
    let total: u64 = files
        .iter()
        .filter_map(|path| std::fs::metadata(path).ok())
        .map(|meta| meta.len())
        .sum();

    let summary = if files.len() == 1 {
        let file_name = files[0]
            .file_name()
            .map_or_else(|| "1 file".to_string(), |n| n.to_string_lossy().into_owned());
        format!("{file_name} ({})", format_size(total))
    } else {
        format!("{} files ({})", files.len(), format_size(total))
    };

    format!("{local_name} wants to send you: {summary}")
}

/// Ask the peer at `addr` for permission to send `files`.
///
/// Returns `true` only for a `YES` answer (case-insensitive). A refused
/// connection, a timeout, or a malformed response all count as rejection,
/// so the caller can simply retry the discovery-and-ask flow. The answer
/// normally comes from a human, so `decision_timeout` is much longer than
/// `connect_timeout`.
///
/// # Errors
///
/// Returns an error only for I/O failures other than refusal or timeout.
pub async fn request_transfer(
    addr: IpAddr,
    handshake_port: u16,
    local_name: &str,
    files: &[PathBuf],
    connect_timeout: Duration,
    decision_timeout: Duration,
) -> Result<bool> {
    let target = SocketAddr::new(addr, handshake_port);
    let stream = match timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) if matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut
        ) =>
        {
            debug!(peer = %target, error = %e, "handshake connection refused");
            return Ok(false);
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            debug!(peer = %target, "handshake connect timed out");
            return Ok(false);
        }
    };
    let mut stream = BufStream::new(stream);

    let line = request_line(local_name, files);
    debug!(peer = %target, request = %line, "sending transfer request");
    protocol::write_line(&mut stream, &line).await?;

    // No answer within the window counts as a rejection.
    let accepted = match timeout(decision_timeout, protocol::read_line(&mut stream)).await {
        Ok(Ok(response)) => response.eq_ignore_ascii_case(HANDSHAKE_ACCEPT),
        Ok(Err(_)) | Err(_) => false,
    };
    info!(peer = %target, accepted, "transfer request answered");
    Ok(accepted)
}

/// Answer incoming transfer requests until one is accepted or the token
/// fires.
///
/// Each connection carries one request line; `decision` is consulted and
/// the verdict written back. Rejections keep the listener serving; the
/// first acceptance closes it, so only one sender is active per session.
/// A failed connection is logged and the loop keeps serving.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn serve_requests(
    handshake_port: u16,
    decision: AcceptDecision,
    decision_timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", handshake_port)).await?;
    info!(port = handshake_port, "listening for transfer requests");

    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => {
                debug!("handshake listener stopped");
                return Ok(());
            }
            result = listener.accept() => result?,
        };

        match answer_request(stream, peer, &decision, decision_timeout).await {
            Ok(true) => {
                info!(peer = %peer, "request accepted, closing handshake listener");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => warn!(peer = %peer, error = %e, "handshake connection failed"),
        }
    }
}

async fn answer_request(
    stream: TcpStream,
    peer: SocketAddr,
    decision: &AcceptDecision,
    decision_timeout: Duration,
) -> Result<bool> {
    let mut stream = BufStream::new(stream);
    let request = timeout(decision_timeout, protocol::read_line(&mut stream))
        .await
        .map_err(|_| Error::HandshakeTimeout(peer))??;

    let accepted = decision(&request);
    info!(peer = %peer, request = %request, accepted, "transfer request decided");

    let verdict = if accepted {
        HANDSHAKE_ACCEPT
    } else {
        HANDSHAKE_REJECT
    };
    protocol::write_line(&mut stream, verdict).await?;
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str, len: usize) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, vec![0u8; len]).expect("write file");
        path
    }

    #[test]
    fn request_line_single_file() {
        let dir = TempDir::new().expect("temp dir");
        let file = touch(&dir, "notes.txt", 2048);
        let line = request_line("alice", &[file]);
        assert_eq!(line, "alice wants to send you: notes.txt (2.0 KB)");
    }

    #[test]
    fn request_line_multiple_files() {
        let dir = TempDir::new().expect("temp dir");
        let files = vec![touch(&dir, "a.bin", 1024), touch(&dir, "b.bin", 1024)];
        let line = request_line("bob", &files);
        assert_eq!(line, "bob wants to send you: 2 files (2.0 KB)");
    }

    #[tokio::test]
    async fn accepted_request_roundtrip() {
        let port = 47_411;
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let decision: AcceptDecision = {
            let calls = Arc::clone(&calls);
            Arc::new(move |request: &str| {
                calls.fetch_add(1, Ordering::SeqCst);
                request.contains("wants to send you")
            })
        };

        let server_cancel = cancel.clone();
        tokio::spawn(async move {
            serve_requests(port, decision, Duration::from_secs(5), server_cancel)
                .await
                .expect("serve");
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let dir = TempDir::new().expect("temp dir");
        let file = touch(&dir, "photo.jpg", 10);
        let accepted = request_transfer(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            "carol",
            &[file],
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .expect("handshake");

        assert!(accepted);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The listener closes after the first acceptance, so a second
        // request finds nobody and counts as rejected.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let file = touch(&dir, "again.jpg", 10);
        let second = request_transfer(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            "carol",
            &[file],
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .expect("no hard error");
        assert!(!second);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unreachable_peer_counts_as_rejection() {
        let dir = TempDir::new().expect("temp dir");
        let file = touch(&dir, "x.bin", 1);
        let accepted = request_transfer(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            47_413,
            "erin",
            &[file],
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .expect("refusal is not an error");
        assert!(!accepted);
    }

    #[tokio::test]
    async fn rejected_request_returns_false() {
        let port = 47_412;
        let cancel = CancellationToken::new();
        let decision: AcceptDecision = Arc::new(|_: &str| false);

        let server_cancel = cancel.clone();
        tokio::spawn(async move {
            serve_requests(port, decision, Duration::from_secs(5), server_cancel)
                .await
                .expect("serve");
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let dir = TempDir::new().expect("temp dir");
        let file = touch(&dir, "x.bin", 1);
        let accepted = request_transfer(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            "dave",
            &[file],
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .expect("handshake");

        assert!(!accepted);
        cancel.cancel();
    }
}
