//! Wire protocol for Lanshare transfers.
//!
//! All multi-byte integers are big-endian. The protocol has four surfaces:
//!
//! ## Discovery packet (UDP broadcast)
//!
//! The raw UTF-8 display name, nothing else.
//!
//! ## Handshake (line-oriented text over TCP)
//!
//! ```text
//! request:  "<name> wants to send you: <summary>\n"
//! response: "YES\n" (accept, case-insensitive) or anything else (reject)
//! ```
//!
//! ## File header (metadata channel, one per file)
//!
//! ```text
//! ┌───────────┬──────────────┬───────────┬──────────────┐
//! │ file_size │ total_chunks │ name_len  │  name bytes  │
//! │  i64      │     u32      │   u32     │   (UTF-8)    │
//! └───────────┴──────────────┴───────────┴──────────────┘
//! ```
//!
//! `file_size == -1` sent alone is the session termination marker; it is
//! checked immediately after reading `file_size`, before any further field.
//! The receiver answers a valid header with the line `"READY\n"`.
//!
//! ## Port map and chunk header
//!
//! ```text
//! port map: u8 version | u32 count | count x (u32 chunk_index, u16 port)
//! ack:      one byte 0x01
//! chunk:    u32 chunk_index | i64 start_offset | u32 length | u32 total_chunks
//! ```
//!
//! The chunk header is followed by exactly `length` raw bytes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};

/// Accept response to a handshake request.
pub const HANDSHAKE_ACCEPT: &str = "YES";

/// Reject response to a handshake request.
pub const HANDSHAKE_REJECT: &str = "NO";

/// Receiver readiness signal on the metadata channel.
pub const READY: &str = "READY";

/// `file_size` value that terminates a session instead of starting a file.
pub const TERMINATION_MARKER: i64 = -1;

/// Port map message version.
pub const PORT_MAP_VERSION: u8 = 1;

/// Acknowledgment byte for the final port map.
pub const PORT_MAP_ACK: u8 = 0x01;

/// Chunk header size in bytes.
pub const CHUNK_HEADER_SIZE: usize = 20;

/// Longest line accepted by [`read_line`], in bytes.
const MAX_LINE_LENGTH: usize = 4096;

/// Metadata for one file, as carried by the file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// File size in bytes; always > 0 on the wire
    pub size: u64,
    /// Number of chunks the sender will open connections for
    pub total_chunks: u32,
    /// Bare filename (no directory components)
    pub name: String,
}

impl FileHeader {
    /// Validate the header the way the receiving side must before any
    /// filesystem work: positive size, at least one chunk, and a filename
    /// that cannot escape the save directory.
    ///
    /// # Errors
    ///
    /// Returns the specific validation failure; it fails the file, not the
    /// session.
    pub fn validate(&self) -> Result<()> {
        if self.total_chunks == 0 {
            return Err(Error::InvalidChunkCount(self.total_chunks));
        }
        validate_file_name(&self.name)
    }
}

/// Write a file header.
///
/// # Errors
///
/// Returns an error if writing fails or the name exceeds the length cap.
pub async fn write_file_header<W>(writer: &mut W, header: &FileHeader) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let name_bytes = header.name.as_bytes();
    let name_len = u32::try_from(name_bytes.len()).unwrap_or(u32::MAX);
    if name_len == 0 || name_len > crate::MAX_NAME_LENGTH {
        return Err(Error::InvalidNameLength(name_len));
    }

    let size = i64::try_from(header.size)
        .map_err(|_| Error::Protocol(format!("file size out of range: {}", header.size)))?;

    writer.write_i64(size).await?;
    writer.write_u32(header.total_chunks).await?;
    writer.write_u32(name_len).await?;
    writer.write_all(name_bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Write the session termination marker: a lone `-1` file size.
///
/// # Errors
///
/// Returns an error if writing fails.
pub async fn write_termination<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_i64(TERMINATION_MARKER).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a file header, or `None` for the session termination marker.
///
/// The marker check happens right after the size field is read; no further
/// bytes are expected on a termination connection.
///
/// # Errors
///
/// Returns an error if reading fails or any field is invalid.
pub async fn read_file_header<R>(reader: &mut R) -> Result<Option<FileHeader>>
where
    R: AsyncReadExt + Unpin,
{
    let size = reader.read_i64().await?;
    if size == TERMINATION_MARKER {
        return Ok(None);
    }
    if size <= 0 {
        return Err(Error::InvalidFileSize(size));
    }

    let total_chunks = reader.read_u32().await?;
    if total_chunks == 0 {
        return Err(Error::InvalidChunkCount(total_chunks));
    }

    let name_len = reader.read_u32().await?;
    if name_len == 0 || name_len > crate::MAX_NAME_LENGTH {
        return Err(Error::InvalidNameLength(name_len));
    }

    let mut name_bytes = vec![0u8; name_len as usize];
    reader.read_exact(&mut name_bytes).await?;
    let name = String::from_utf8(name_bytes)
        .map_err(|_| Error::Protocol("filename is not valid UTF-8".to_string()))?;

    validate_file_name(&name)?;

    #[allow(clippy::cast_sign_loss)]
    let size = size as u64;
    Ok(Some(FileHeader {
        size,
        total_chunks,
        name,
    }))
}

/// Header preceding one chunk's bytes on its own connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Chunk index in `[0, total_chunks)`
    pub index: u32,
    /// Byte offset of this chunk in the file
    pub start_offset: u64,
    /// Number of data bytes that follow
    pub length: u32,
    /// Total chunks in the file, for cross-checking
    pub total_chunks: u32,
}

impl ChunkHeader {
    /// Encode the header to its fixed wire form.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.index.to_be_bytes());
        buf[4..12].copy_from_slice(&(self.start_offset as i64).to_be_bytes());
        buf[12..16].copy_from_slice(&self.length.to_be_bytes());
        buf[16..20].copy_from_slice(&self.total_chunks.to_be_bytes());
        buf
    }

    /// Decode a header from its fixed wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if the offset field is negative.
    pub fn decode(buf: &[u8; CHUNK_HEADER_SIZE]) -> Result<Self> {
        let index = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let start_offset = i64::from_be_bytes([
            buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
        ]);
        let length = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let total_chunks = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);

        if start_offset < 0 {
            return Err(Error::InvalidChunkHeader {
                index,
                reason: format!("negative start offset: {start_offset}"),
            });
        }

        #[allow(clippy::cast_sign_loss)]
        let start_offset = start_offset as u64;
        Ok(Self {
            index,
            start_offset,
            length,
            total_chunks,
        })
    }
}

/// Write a chunk header.
///
/// # Errors
///
/// Returns an error if writing fails.
pub async fn write_chunk_header<W>(writer: &mut W, header: &ChunkHeader) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(&header.encode()).await?;
    Ok(())
}

/// Read a chunk header.
///
/// # Errors
///
/// Returns an error if reading fails or the header is invalid.
pub async fn read_chunk_header<R>(reader: &mut R) -> Result<ChunkHeader>
where
    R: AsyncReadExt + Unpin,
{
    let mut buf = [0u8; CHUNK_HEADER_SIZE];
    reader.read_exact(&mut buf).await?;
    ChunkHeader::decode(&buf)
}

/// Write a chunk-index → port mapping as one versioned batch message.
///
/// # Errors
///
/// Returns an error if writing fails.
pub async fn write_port_map<W>(writer: &mut W, map: &BTreeMap<u32, u16>) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_u8(PORT_MAP_VERSION).await?;
    writer
        .write_u32(u32::try_from(map.len()).map_err(|_| {
            Error::PortNegotiationFailed(format!("port map too large: {} entries", map.len()))
        })?)
        .await?;
    for (&index, &port) in map {
        writer.write_u32(index).await?;
        writer.write_u16(port).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read a chunk-index → port mapping.
///
/// # Errors
///
/// Returns an error if reading fails, the version is unknown, or the map
/// repeats a chunk index.
pub async fn read_port_map<R>(reader: &mut R) -> Result<BTreeMap<u32, u16>>
where
    R: AsyncReadExt + Unpin,
{
    let version = reader.read_u8().await?;
    if version != PORT_MAP_VERSION {
        return Err(Error::PortNegotiationFailed(format!(
            "unsupported port map version: {version}"
        )));
    }

    let count = reader.read_u32().await?;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let index = reader.read_u32().await?;
        let port = reader.read_u16().await?;
        if map.insert(index, port).is_some() {
            return Err(Error::PortNegotiationFailed(format!(
                "duplicate chunk index in port map: {index}"
            )));
        }
    }
    Ok(map)
}

/// Write a line terminated by `\n`.
///
/// # Errors
///
/// Returns an error if writing fails.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Read a `\n`-terminated line, stripping the terminator and any `\r`.
///
/// # Errors
///
/// Returns an error if reading fails, the stream ends mid-line, or the line
/// exceeds the length cap.
pub async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncReadExt + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if byte != b'\r' {
            line.push(byte);
        }
        if line.len() > MAX_LINE_LENGTH {
            return Err(Error::Protocol("line too long".to_string()));
        }
    }
    String::from_utf8(line).map_err(|_| Error::Protocol("line is not valid UTF-8".to_string()))
}

/// Check a filename before it is used to build a destination path.
///
/// Rejects anything that could escape the save directory or is not a plain
/// portable filename: emptiness, `..`, path separators, and the reserved
/// characters `< > : " | ? *`.
///
/// # Errors
///
/// Returns [`Error::InvalidFileName`] when the name is unsafe.
pub fn validate_file_name(name: &str) -> Result<()> {
    let unsafe_name = name.is_empty()
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.chars().any(|c| matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*'))
        || name.chars().any(char::is_control);

    if unsafe_name {
        return Err(Error::InvalidFileName(name.to_string()));
    }
    Ok(())
}

/// Pick a destination path under `dir` that does not collide with an
/// existing file, appending `_1`, `_2`, ... before the extension as needed.
#[must_use]
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, extension) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };

    let mut counter = 1;
    loop {
        let attempt = extension.map_or_else(
            || format!("{stem}_{counter}"),
            |ext| format!("{stem}_{counter}.{ext}"),
        );
        let path = dir.join(attempt);
        if !path.exists() {
            return path;
        }
        counter += 1;
    }
}

/// Format a byte count for status messages.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_header_roundtrip() {
        let header = FileHeader {
            size: 123_456_789,
            total_chunks: 7,
            name: "video.mkv".to_string(),
        };

        let mut buf = Vec::new();
        write_file_header(&mut buf, &header).await.expect("write");

        let mut cursor = Cursor::new(buf);
        let decoded = read_file_header(&mut cursor).await.expect("read");
        assert_eq!(decoded, Some(header));
    }

    #[tokio::test]
    async fn termination_marker_short_circuits() {
        let mut buf = Vec::new();
        write_termination(&mut buf).await.expect("write");
        assert_eq!(buf.len(), 8, "marker is a lone i64");

        let mut cursor = Cursor::new(buf);
        let decoded = read_file_header(&mut cursor).await.expect("read");
        assert_eq!(decoded, None);
    }

    #[tokio::test]
    async fn zero_and_negative_sizes_rejected() {
        for size in [0i64, -2, -100] {
            let mut buf = Vec::new();
            buf.extend_from_slice(&size.to_be_bytes());
            let mut cursor = Cursor::new(buf);
            let result = read_file_header(&mut cursor).await;
            assert!(
                matches!(result, Err(Error::InvalidFileSize(s)) if s == size),
                "size {size} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn oversized_name_length_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1i64.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&2000u32.to_be_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_file_header(&mut cursor).await,
            Err(Error::InvalidNameLength(2000))
        ));
    }

    #[test]
    fn chunk_header_roundtrip() {
        let header = ChunkHeader {
            index: 3,
            start_offset: 3 * 64 * 1024 * 1024,
            length: 64 * 1024 * 1024,
            total_chunks: 5,
        };
        let decoded = ChunkHeader::decode(&header.encode()).expect("decode");
        assert_eq!(decoded, header);
    }

    #[test]
    fn chunk_header_negative_offset_rejected() {
        let mut buf = ChunkHeader {
            index: 0,
            start_offset: 0,
            length: 1,
            total_chunks: 1,
        }
        .encode();
        buf[4..12].copy_from_slice(&(-1i64).to_be_bytes());
        assert!(ChunkHeader::decode(&buf).is_err());
    }

    #[tokio::test]
    async fn port_map_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert(0, 9091);
        map.insert(1, 9092);
        map.insert(2, 51234);

        let mut buf = Vec::new();
        write_port_map(&mut buf, &map).await.expect("write");

        let mut cursor = Cursor::new(buf);
        let decoded = read_port_map(&mut cursor).await.expect("read");
        assert_eq!(decoded, map);
    }

    #[tokio::test]
    async fn port_map_unknown_version_rejected() {
        let buf = vec![9u8, 0, 0, 0, 0];
        let mut cursor = Cursor::new(buf);
        assert!(read_port_map(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn line_roundtrip_strips_crlf() {
        let mut buf = Vec::new();
        write_line(&mut buf, "READY").await.expect("write");
        buf.clear();
        buf.extend_from_slice(b"YES\r\n");
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_line(&mut cursor).await.expect("read"), "YES");
    }

    #[test]
    fn escape_filenames_rejected() {
        for name in [
            "",
            "..",
            "../etc/passwd",
            "a/b.txt",
            "a\\b.txt",
            "con<tent>.txt",
            "what?.bin",
            "pipe|name",
            "quote\"name",
            "colon:name",
            "star*name",
        ] {
            assert!(
                validate_file_name(name).is_err(),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn plain_filenames_accepted() {
        for name in ["file.txt", "archive.tar.gz", "no_extension", "über.pdf"] {
            assert!(validate_file_name(name).is_ok(), "{name:?} should pass");
        }
    }

    #[test]
    fn unique_destination_suffixes() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let dir = temp_dir.path();

        assert_eq!(unique_destination(dir, "a.txt"), dir.join("a.txt"));

        std::fs::write(dir.join("a.txt"), b"x").expect("write");
        assert_eq!(unique_destination(dir, "a.txt"), dir.join("a_1.txt"));

        std::fs::write(dir.join("a_1.txt"), b"x").expect("write");
        assert_eq!(unique_destination(dir, "a.txt"), dir.join("a_2.txt"));

        std::fs::write(dir.join("noext"), b"x").expect("write");
        assert_eq!(unique_destination(dir, "noext"), dir.join("noext_1"));
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(64 * 1024 * 1024), "64.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
