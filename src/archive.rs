//! Tar+gzip transfers
//!
//! Input data arrives as a streamed tar+gzip download and is unpacked into
//! the job workspace. Output goes the other way: a blocking producer packs
//! the output directory into a bounded channel that backs the HTTP request
//! body, so the archive is never materialised on disk.

use anyhow::{Context, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::TryStreamExt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, warn};

/// Size of the chunks handed to the request body
const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the packer and the HTTP client
const CHANNEL_DEPTH: usize = 8;

/// Unpack a tar+gzip stream into `dest`, keeping file modes.
pub fn unpack_tar_gz<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(dest)
        .with_context(|| format!("Failed to unpack archive into {}", dest.display()))
}

/// Unpack a streamed download without buffering it in memory.
pub async fn unpack_response(response: reqwest::Response, dest: PathBuf) -> Result<()> {
    let stream = response.bytes_stream().map_err(io::Error::other);
    let reader = SyncIoBridge::new(StreamReader::new(stream));

    tokio::task::spawn_blocking(move || unpack_tar_gz(reader, &dest))
        .await
        .context("Unpack task panicked")?
}

/// Pack the entries of `dir` (not `dir` itself) as tar+gzip into `writer`.
pub fn pack_dir<W: Write>(dir: &Path, writer: W) -> Result<W> {
    let mut builder = tar::Builder::new(GzEncoder::new(writer, Compression::default()));
    builder.follow_symlinks(false);

    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        if entry.file_type()?.is_dir() {
            builder
                .append_dir_all(&name, &path)
                .with_context(|| format!("Failed to archive {}", path.display()))?;
        } else {
            builder
                .append_path_with_name(&path, &name)
                .with_context(|| format!("Failed to archive {}", path.display()))?;
        }
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Stream a tar+gzip of `dir` through a bounded channel.
///
/// A packing error is delivered as the last stream item so the HTTP
/// client aborts the request instead of sending a truncated archive.
pub fn pack_dir_stream(dir: PathBuf) -> ReceiverStream<io::Result<Bytes>> {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);

    tokio::task::spawn_blocking(move || {
        let writer = ChannelWriter {
            tx: tx.clone(),
            buf: Vec::with_capacity(CHUNK_SIZE),
        };
        let result = pack_dir(&dir, writer).and_then(|mut w| {
            w.flush()?;
            Ok(())
        });
        match result {
            Ok(()) => debug!("Packed {}", dir.display()),
            Err(e) => {
                warn!("Failed to pack {}: {:#}", dir.display(), e);
                let _ = tx.blocking_send(Err(io::Error::other(format!("{:#}", e))));
            }
        }
    });

    ReceiverStream::new(rx)
}

/// Request body streaming a tar+gzip of `dir`.
pub fn pack_dir_body(dir: PathBuf) -> reqwest::Body {
    reqwest::Body::wrap_stream(pack_dir_stream(dir))
}

/// Blocking writer that forwards full chunks into the body channel
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::replace(
            &mut self.buf,
            Vec::with_capacity(CHUNK_SIZE),
        ));
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "request body dropped"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use httpmock::prelude::*;
    use std::os::unix::fs::PermissionsExt;

    fn populate(dir: &Path) {
        fs::write(dir.join("result.txt"), b"hello\n").unwrap();
        fs::create_dir(dir.join("nested")).unwrap();
        let script = dir.join("nested").join("run.sh");
        fs::write(&script, b"#!/bin/sh\necho ok\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn test_pack_unpack_preserves_names_contents_modes() {
        let src = tempfile::tempdir().unwrap();
        populate(src.path());

        let archive = pack_dir(src.path(), Vec::new()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        unpack_tar_gz(archive.as_slice(), dest.path()).unwrap();

        assert_eq!(
            fs::read(dest.path().join("result.txt")).unwrap(),
            b"hello\n"
        );
        let script = dest.path().join("nested").join("run.sh");
        assert_eq!(fs::read(&script).unwrap(), b"#!/bin/sh\necho ok\n");
        assert_eq!(mode(&script), 0o755);
    }

    #[test]
    fn test_empty_dir_yields_valid_archive() {
        let src = tempfile::tempdir().unwrap();
        let archive = pack_dir(src.path(), Vec::new()).unwrap();
        assert!(!archive.is_empty());

        let dest = tempfile::tempdir().unwrap();
        unpack_tar_gz(archive.as_slice(), dest.path()).unwrap();
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_stream_matches_archive() {
        let src = tempfile::tempdir().unwrap();
        populate(src.path());
        // Larger than one chunk so the channel carries several items
        fs::write(src.path().join("big.bin"), vec![7u8; 3 * CHUNK_SIZE]).unwrap();

        let mut stream = pack_dir_stream(src.path().to_path_buf());
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk.unwrap());
        }

        let dest = tempfile::tempdir().unwrap();
        unpack_tar_gz(archive.as_slice(), dest.path()).unwrap();
        assert_eq!(
            fs::read(dest.path().join("big.bin")).unwrap().len(),
            3 * CHUNK_SIZE
        );
        assert!(dest.path().join("nested").join("run.sh").exists());
    }

    #[tokio::test]
    async fn test_stream_reports_missing_dir() {
        let mut stream = pack_dir_stream(PathBuf::from("/nonexistent/emrys/output"));
        let first = stream.next().await.unwrap();
        assert!(first.is_err());
    }

    #[tokio::test]
    async fn test_unpack_response() {
        let src = tempfile::tempdir().unwrap();
        populate(src.path());
        let archive = pack_dir(src.path(), Vec::new()).unwrap();

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/miner/job/j1");
            then.status(200).body(archive.clone());
        });

        let response = reqwest::get(server.url("/miner/job/j1")).await.unwrap();
        let dest = tempfile::tempdir().unwrap();
        unpack_response(response, dest.path().to_path_buf())
            .await
            .unwrap();
        assert_eq!(
            fs::read(dest.path().join("result.txt")).unwrap(),
            b"hello\n"
        );
    }
}
