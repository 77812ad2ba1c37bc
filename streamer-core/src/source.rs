//! Collaborator seams: where songs come from and how they become PCM bytes.

use std::{
    collections::{BTreeMap, VecDeque},
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::garbage::{Collector, Garbage};

#[derive(Debug, Clone, PartialEq)]
pub struct Song {
    pub filename: PathBuf,
    pub metadata: String,
}

impl Song {
    pub fn new(filename: impl Into<PathBuf>, metadata: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            metadata: metadata.into(),
        }
    }
}

/// Upcoming songs. `peek(0)` is the song that plays next.
pub trait SongQueue: Send + Sync {
    fn peek(&self, index: usize) -> Option<Song>;
    fn pop(&self) -> Option<Song>;
}

/// A [`SongQueue`] held in memory.
#[derive(Default)]
pub struct MemoryQueue {
    songs: Mutex<VecDeque<Song>>,
}

impl MemoryQueue {
    pub fn push(&self, song: Song) {
        self.songs.lock().push_back(song);
    }

    pub fn len(&self) -> usize {
        self.songs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.lock().is_empty()
    }
}

impl FromIterator<Song> for MemoryQueue {
    fn from_iter<T: IntoIterator<Item = Song>>(songs: T) -> Self {
        Self {
            songs: Mutex::new(songs.into_iter().collect()),
        }
    }
}

impl SongQueue for MemoryQueue {
    fn peek(&self, index: usize) -> Option<Song> {
        self.songs.lock().get(index).cloned()
    }

    fn pop(&self) -> Option<Song> {
        self.songs.lock().pop_front()
    }
}

/// An open file producing raw PCM.
pub trait Decoder: Send {
    /// Reads up to `size` bytes. An empty result is the end of the stream.
    fn read(&mut self, size: usize) -> anyhow::Result<Bytes>;

    /// Length of the decoded stream in bytes, when known upfront.
    fn total_len(&self) -> Option<u64> {
        None
    }

    /// Releases the underlying handle. `Ok(false)` asks to be retried later.
    fn close(&mut self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

pub trait DecoderFactory: Send + Sync {
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn Decoder>>;
}

/// Tag lookup. `None` when the file carries no tags.
pub trait MetadataReader: Send + Sync {
    fn read(&self, path: &Path) -> anyhow::Result<Option<BTreeMap<String, Vec<String>>>>;
}

/// A song as handed to the playback stages.
pub trait AudioFile: Send + Sync {
    fn metadata(&self) -> &str;

    /// Reads up to `size` bytes of PCM. An empty result is the end of the file.
    fn read(&self, size: usize) -> anyhow::Result<Bytes>;

    /// Gives up any open resources. Further reads return end of file.
    fn close(&self);
}

/// A decoder waiting to be closed off the playback thread.
pub struct DecoderGarbage {
    decoder: Box<dyn Decoder>,
}

impl DecoderGarbage {
    pub fn new(decoder: Box<dyn Decoder>) -> Self {
        Self { decoder }
    }
}

impl Garbage for DecoderGarbage {
    fn collect(&mut self) -> anyhow::Result<bool> {
        self.decoder.close()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
    pub data: Bytes,
    /// Bytes read so far, `data` included.
    pub position: u64,
    pub total: Option<u64>,
}

enum Slot {
    Unopened,
    Open(Box<dyn Decoder>),
    Done,
}

/// Reads a file through a lazily opened decoder.
///
/// The decoder is handed to the [`Collector`] once the stream ends, a read
/// fails, or the file is closed or dropped.
pub struct DecoderFile {
    path: PathBuf,
    decoders: Arc<dyn DecoderFactory>,
    collector: Collector,
    slot: Slot,
    position: u64,
    total: Option<u64>,
}

impl DecoderFile {
    pub fn new(path: PathBuf, decoders: Arc<dyn DecoderFactory>, collector: Collector) -> Self {
        Self {
            path,
            decoders,
            collector,
            slot: Slot::Unopened,
            position: 0,
            total: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the decoder now instead of on the first read.
    pub fn open(&mut self) -> anyhow::Result<()> {
        if !matches!(self.slot, Slot::Unopened) {
            return Ok(());
        }

        match self.decoders.open(&self.path) {
            Ok(decoder) => {
                self.total = decoder.total_len();
                self.slot = Slot::Open(decoder);
                Ok(())
            }
            Err(e) => {
                self.slot = Slot::Done;
                Err(e.context(format!("opening {}", self.path.display())))
            }
        }
    }

    pub fn read(&mut self, size: usize) -> anyhow::Result<ReadOutcome> {
        self.open()?;

        let data = match &mut self.slot {
            Slot::Open(decoder) => decoder.read(size),
            _ => Ok(Bytes::new()),
        };

        match data {
            Ok(data) => {
                if data.is_empty() {
                    self.release();
                }
                self.position += data.len() as u64;
                Ok(ReadOutcome {
                    data,
                    position: self.position,
                    total: self.total,
                })
            }
            Err(e) => {
                self.release();
                Err(e.context(format!("reading {}", self.path.display())))
            }
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.slot, Slot::Done)
    }

    pub fn close(&mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Slot::Open(decoder) = std::mem::replace(&mut self.slot, Slot::Done) {
            self.collector.register(DecoderGarbage::new(decoder));
        }
    }
}

impl Drop for DecoderFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// An [`AudioFile`] that decodes straight from disk.
pub struct PlainAudioFile {
    metadata: String,
    file: Mutex<DecoderFile>,
}

impl PlainAudioFile {
    pub fn new(metadata: impl Into<String>, file: DecoderFile) -> Self {
        Self {
            metadata: metadata.into(),
            file: Mutex::new(file),
        }
    }

    /// Opens `path` right away, failing when no decoder accepts it.
    pub fn open(
        path: &Path,
        decoders: Arc<dyn DecoderFactory>,
        collector: Collector,
    ) -> anyhow::Result<Self> {
        let mut file = DecoderFile::new(path.to_path_buf(), decoders, collector);
        file.open()?;
        Ok(Self::new(path.display().to_string(), file))
    }
}

impl AudioFile for PlainAudioFile {
    fn metadata(&self) -> &str {
        &self.metadata
    }

    fn read(&self, size: usize) -> anyhow::Result<Bytes> {
        Ok(self.file.lock().read(size)?.data)
    }

    fn close(&self) {
        self.file.lock().close();
    }
}

#[cfg(test)]
#[path = "source_test.rs"]
mod source_test;
