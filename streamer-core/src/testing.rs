//! In-memory collaborators shared by the unit tests.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::source::{Decoder, DecoderFactory};

pub struct MemoryDecoder {
    data: Bytes,
    fail_at: Option<usize>,
    closed: Arc<AtomicUsize>,
}

impl Decoder for MemoryDecoder {
    fn read(&mut self, size: usize) -> anyhow::Result<Bytes> {
        if let Some(fail_at) = self.fail_at {
            if self.data.len() <= fail_at {
                anyhow::bail!("corrupt frame");
            }
        }
        let size = size.min(self.data.len());
        Ok(self.data.split_to(size))
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn close(&mut self) -> anyhow::Result<bool> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Serves files from a map. Unknown paths fail to open.
#[derive(Default)]
pub struct MemoryDecoders {
    files: HashMap<PathBuf, Bytes>,
    /// Remaining length at which reads start failing.
    failing: HashMap<PathBuf, usize>,
    pub opened: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl MemoryDecoders {
    pub fn with_file(mut self, path: &str, data: impl Into<Bytes>) -> Self {
        self.files.insert(PathBuf::from(path), data.into());
        self
    }

    pub fn failing_after(mut self, path: &str, data: impl Into<Bytes>, good: usize) -> Self {
        let data = data.into();
        self.failing
            .insert(PathBuf::from(path), data.len().saturating_sub(good));
        self.files.insert(PathBuf::from(path), data);
        self
    }
}

impl DecoderFactory for MemoryDecoders {
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn Decoder>> {
        let data = self
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unsupported file {}", path.display()))?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryDecoder {
            data,
            fail_at: self.failing.get(path).copied(),
            closed: Arc::clone(&self.closed),
        }))
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
