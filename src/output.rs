//! Encodes every pushed audio file to MP3 and writes the stream to a file.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    sync::Arc,
    thread::JoinHandle,
};

use anyhow::Context as _;
use bytes::Bytes;
use parking_lot::Mutex;
use streamer_core::{
    config::Options,
    engine::compose,
    events::{AUDIOFILE, EventManager, Subscription},
    files::{audiofile_events, encode_pcm_with_lame, read_audio_files},
    garbage::Collector,
    manager::{Component, ComponentBuilder, Context},
};
use tokio_util::sync::CancellationToken;

pub struct FileOutput {
    path: PathBuf,
    events: Arc<EventManager>,
    collector: Collector,
    options: Options,
    subscription: Mutex<Option<Subscription>>,
    worker: Mutex<Option<JoinHandle<anyhow::Result<u64>>>>,
    cancel: CancellationToken,
}

impl FileOutput {
    /// Subscribes to audio files right away so none pushed before `start` are lost.
    pub fn new(
        context: &Context,
        path: PathBuf,
        options: Options,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            path,
            events: Arc::clone(&context.events),
            collector: context.collector.clone(),
            options,
            subscription: Mutex::new(Some(context.events.register(AUDIOFILE))),
            worker: Mutex::new(None),
            cancel,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Component for FileOutput {
    fn start(&self) -> anyhow::Result<()> {
        let mut worker = self.worker.lock();
        let Some(subscription) = self.subscription.lock().take() else {
            return Ok(());
        };

        let chain = compose(
            vec![
                audiofile_events(subscription),
                read_audio_files(),
                encode_pcm_with_lame(self.collector.clone()),
            ],
            &self.options,
        )
        .context("composing the output pipeline")?;
        let mut writer = BufWriter::new(
            File::create(&self.path)
                .with_context(|| format!("creating {}", self.path.display()))?,
        );

        let path = self.path.clone();
        let cancel = self.cancel.clone();
        let handle = std::thread::Builder::new()
            .name("file-output".to_string())
            .spawn(move || {
                let _guard = cancel.clone().drop_guard();
                let mut written = 0u64;
                for chunk in chain.payloads::<Bytes>() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    writer
                        .write_all(&chunk)
                        .with_context(|| format!("writing {}", path.display()))?;
                    written += chunk.len() as u64;
                }
                writer.flush()?;
                log::info!("wrote {} byte(s) of MP3 to {}", written, path.display());
                Ok(written)
            })?;

        *worker = Some(handle);
        log::info!("streaming to {}", self.path().display());
        Ok(())
    }

    /// Stops the worker and waits for it. Closes the event channels on the
    /// way, since the worker only returns once its subscription ends.
    fn close(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.events.close();
        self.subscription.lock().take();

        let Some(handle) = self.worker.lock().take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("file output worker panicked"))??;
        Ok(())
    }
}

pub struct FileOutputBuilder {
    path: PathBuf,
    cancel: CancellationToken,
}

impl FileOutputBuilder {
    /// `cancel` is triggered when the worker stops for any reason.
    pub fn new(path: PathBuf, cancel: CancellationToken) -> Self {
        Self { path, cancel }
    }
}

impl ComponentBuilder for FileOutputBuilder {
    fn build(
        self: Box<Self>,
        context: &Context,
        _previous: Option<Arc<dyn Component>>,
        options: &Options,
    ) -> anyhow::Result<Arc<dyn Component>> {
        Ok(Arc::new(FileOutput::new(
            context,
            self.path,
            options.clone(),
            self.cancel,
        )))
    }
}

#[cfg(test)]
#[path = "output_test.rs"]
mod output_test;
