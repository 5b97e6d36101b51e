//! Streaming tar.gz writer.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::io::{ReaderStream, SyncIoBridge};
use tracing::{debug, warn};

use super::entries::ArchiveEntry;
use super::DEFAULT_COMPRESSION_LEVEL;
use crate::{CumulusError, Result};

/// Capacity of the pipe between the archive writer and the response body.
const PIPE_CAPACITY: usize = 64 * 1024;

/// A streamed archive body.
pub type ArchiveStream = BoxStream<'static, io::Result<Bytes>>;

/// Writes archive entries as a gzip-compressed tar stream.
#[derive(Debug, Clone, Copy)]
pub struct Archiver {
    compression_level: u32,
}

impl Default for Archiver {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL)
    }
}

impl Archiver {
    /// Create an archiver; levels above 9 are clamped.
    pub fn new(compression_level: u32) -> Self {
        Self {
            compression_level: compression_level.min(9),
        }
    }

    pub fn compression_level(&self) -> u32 {
        self.compression_level
    }

    /// Start streaming `entries` as a tar.gz body.
    ///
    /// Entries are pulled and written on a blocking thread while the returned
    /// stream is consumed. Dropping the stream stops the writer at its next
    /// write. A failure ends the stream with an error after whatever was
    /// already written. Must be called from within a Tokio runtime.
    pub fn stream<I>(&self, entries: I) -> ArchiveStream
    where
        I: Iterator<Item = Result<ArchiveEntry>> + Send + 'static,
    {
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let bridge = SyncIoBridge::new(writer);
        let level = self.compression_level;

        let task = tokio::task::spawn_blocking(move || write_archive(bridge, entries, level));

        let tail = stream::once(async move {
            match task.await {
                Ok(Ok(count)) => {
                    debug!("Archive complete: {} entries", count);
                    None
                }
                Ok(Err(e)) => {
                    warn!("Archive aborted: {}", e);
                    Some(Err(io::Error::other(e.to_string())))
                }
                Err(e) => Some(Err(io::Error::other(format!("archive writer failed: {e}")))),
            }
        })
        .filter_map(futures::future::ready);

        ReaderStream::new(reader).chain(tail).boxed()
    }
}

/// Write every entry into a tar.gz stream over `writer`, returning the entry count.
pub fn write_archive<W, I>(writer: W, entries: I, level: u32) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = Result<ArchiveEntry>>,
{
    let encoder = GzEncoder::new(writer, Compression::new(level));
    let mut builder = tar::Builder::new(encoder);
    let mut count = 0;

    for entry in entries {
        match entry? {
            ArchiveEntry::Directory { path } => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
                builder
                    .append_data(&mut header, Path::new(&path), io::empty())
                    .map_err(|e| archive_error(&path, e))?;
            }
            ArchiveEntry::File {
                path,
                source,
                modified,
                ..
            } => {
                let file = File::open(&source).map_err(|e| archive_error(&path, e))?;
                let len = file.metadata().map_err(|e| archive_error(&path, e))?.len();

                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(len);
                header.set_mtime(modified.timestamp().max(0) as u64);
                builder
                    .append_data(&mut header, Path::new(&path), file)
                    .map_err(|e| archive_error(&path, e))?;
            }
        }
        count += 1;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| CumulusError::Archive(e.to_string()))?;
    let mut writer = encoder
        .finish()
        .map_err(|e| CumulusError::Archive(e.to_string()))?;
    writer
        .flush()
        .map_err(|e| CumulusError::Archive(e.to_string()))?;

    Ok(count)
}

fn archive_error(path: &str, e: io::Error) -> CumulusError {
    match e.kind() {
        io::ErrorKind::BrokenPipe => CumulusError::Archive("client disconnected".to_string()),
        _ => CumulusError::Archive(format!("{path}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use futures::TryStreamExt;
    use std::io::Read;
    use tempfile::TempDir;

    fn read_back(bytes: &[u8]) -> Vec<(String, tar::EntryType, Vec<u8>)> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                let kind = entry.header().entry_type();
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                (path, kind, content)
            })
            .collect()
    }

    fn file_entry(dir: &TempDir, path: &str, content: &[u8]) -> ArchiveEntry {
        let source = dir.path().join(path.replace('/', "_"));
        std::fs::write(&source, content).unwrap();
        ArchiveEntry::File {
            path: path.to_string(),
            source,
            size: content.len() as u64,
            modified: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_write_archive_entries() {
        let dir = TempDir::new().unwrap();
        let entries: Vec<Result<ArchiveEntry>> = vec![
            Ok(file_entry(&dir, "a.txt", b"alpha")),
            Ok(ArchiveEntry::Directory {
                path: "empty/".to_string(),
            }),
            Ok(file_entry(&dir, "sub/b.txt", b"beta")),
        ];

        let mut out = Vec::new();
        let count = write_archive(&mut out, entries, 3).unwrap();
        assert_eq!(count, 3);

        let read = read_back(&out);
        assert_eq!(read.len(), 3);
        assert_eq!(read[0].0, "a.txt");
        assert_eq!(read[0].2, b"alpha");
        assert_eq!(read[1].0.trim_end_matches('/'), "empty");
        assert_eq!(read[1].1, tar::EntryType::Directory);
        assert_eq!(read[2].0, "sub/b.txt");
        assert_eq!(read[2].2, b"beta");
    }

    #[test]
    fn test_write_archive_missing_blob_fails() {
        let dir = TempDir::new().unwrap();
        let entries: Vec<Result<ArchiveEntry>> = vec![
            Ok(file_entry(&dir, "a.txt", b"alpha")),
            Ok(ArchiveEntry::File {
                path: "gone.txt".to_string(),
                source: dir.path().join("gone"),
                size: 1,
                modified: chrono::Utc::now(),
            }),
        ];

        let result = write_archive(Vec::new(), entries, 3);
        match result {
            Err(CumulusError::Archive(msg)) => assert!(msg.contains("gone.txt")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_entry_error_fails_archive() {
        let entries: Vec<Result<ArchiveEntry>> =
            vec![Err(CumulusError::Archive("broken".to_string()))];
        assert!(write_archive(Vec::new(), entries, 3).is_err());
    }

    #[test]
    fn test_compression_level_clamped() {
        assert_eq!(Archiver::new(42).compression_level(), 9);
        assert_eq!(Archiver::default().compression_level(), 3);
    }

    #[tokio::test]
    async fn test_stream_produces_archive() {
        let dir = TempDir::new().unwrap();
        let big = vec![7u8; 300 * 1024];
        let entries: Vec<Result<ArchiveEntry>> = vec![
            Ok(file_entry(&dir, "big.bin", &big)),
            Ok(file_entry(&dir, "small.txt", b"small")),
        ];

        let chunks: Vec<Bytes> = Archiver::default()
            .stream(entries.into_iter())
            .try_collect()
            .await
            .unwrap();
        let body: Vec<u8> = chunks.concat();

        let read = read_back(&body);
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].2, big);
        assert_eq!(read[1].2, b"small");
    }

    #[tokio::test]
    async fn test_stream_failure_is_terminal_error() {
        let dir = TempDir::new().unwrap();
        let entries: Vec<Result<ArchiveEntry>> = vec![
            Ok(file_entry(&dir, "a.txt", b"alpha")),
            Ok(ArchiveEntry::File {
                path: "gone.txt".to_string(),
                source: dir.path().join("gone"),
                size: 1,
                modified: chrono::Utc::now(),
            }),
        ];

        let result: io::Result<Vec<Bytes>> = Archiver::default()
            .stream(entries.into_iter())
            .try_collect()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dropped_stream_stops_writer() {
        let dir = TempDir::new().unwrap();
        let big = vec![1u8; 4 * 1024 * 1024];
        let entries: Vec<Result<ArchiveEntry>> = (0..8)
            .map(|i| Ok(file_entry(&dir, &format!("f{i}.bin"), &big)))
            .collect();

        let mut stream = Archiver::new(0).stream(entries.into_iter());
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.is_empty());
        drop(stream);

        // The blocking writer hits a broken pipe instead of writing 32 MiB
        let (writer, reader) = tokio::io::duplex(16);
        drop(reader);
        let bridge = SyncIoBridge::new(writer);
        let entries: Vec<Result<ArchiveEntry>> = vec![Ok(file_entry(&dir, "x.bin", &big))];
        let result = tokio::task::spawn_blocking(move || write_archive(bridge, entries, 0))
            .await
            .unwrap();
        assert!(matches!(result, Err(CumulusError::Archive(_))));
    }
}
