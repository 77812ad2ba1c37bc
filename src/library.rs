//! A directory of headerless PCM files, played in file name order.

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use streamer_core::source::{Decoder, DecoderFactory, MemoryQueue, Song};

const EXTENSIONS: [&str; 2] = ["pcm", "raw"];

pub fn is_pcm(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

/// Queues every PCM file directly inside `directory`. The song metadata is the file stem.
pub fn scan(directory: &Path) -> anyhow::Result<MemoryQueue> {
    let entries = std::fs::read_dir(directory)
        .with_context(|| format!("reading directory {}", directory.display()))?;

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_pcm(&path) {
            paths.push(path);
        } else {
            log::debug!("not queueing {}", path.display());
        }
    }
    paths.sort();
    log::info!("queued {} song(s) from {}", paths.len(), directory.display());

    Ok(paths
        .into_iter()
        .map(|path| {
            let metadata = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            Song::new(path, metadata)
        })
        .collect())
}

pub struct RawPcmDecoder {
    file: Option<File>,
    total: Option<u64>,
}

impl RawPcmDecoder {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)?;
        let total = file.metadata().ok().map(|metadata| metadata.len());
        Ok(Self {
            file: Some(file),
            total,
        })
    }
}

impl Decoder for RawPcmDecoder {
    /// Fills up to `size` bytes; short only at the end of the file.
    fn read(&mut self, size: usize) -> anyhow::Result<Bytes> {
        let Some(file) = self.file.as_mut() else {
            return Ok(Bytes::new());
        };

        let mut buf = BytesMut::zeroed(size);
        let mut filled = 0;
        while filled < size {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf.freeze())
    }

    fn total_len(&self) -> Option<u64> {
        self.total
    }

    fn close(&mut self) -> anyhow::Result<bool> {
        self.file = None;
        Ok(true)
    }
}

/// Opens `.pcm` and `.raw` files; anything else is unsupported.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawPcmDecoders;

impl DecoderFactory for RawPcmDecoders {
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn Decoder>> {
        if !is_pcm(path) {
            anyhow::bail!("unsupported file {}", path.display());
        }
        Ok(Box::new(RawPcmDecoder::open(path)?))
    }
}

#[cfg(test)]
#[path = "library_test.rs"]
mod library_test;
