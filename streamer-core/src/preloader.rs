//! Look-ahead cache of upcoming songs.
//!
//! A book-keeper thread owns the window of [`PreloadedAudioFile`]s and reacts
//! to five event channels:
//!
//! | event              | effect                                                   |
//! |--------------------|----------------------------------------------------------|
//! | `preload_new_song` | append the next queued song to the window                |
//! | `preload_next`     | start buffering the next unbuffered entry on its own thread |
//! | `preload_push`     | publish the front entry on `audiofile`, ask for a new song |
//! | `metadata`         | the front entry started playing, pop it from the queue   |
//! | `preload_exit`     | close the window and stop                                |
//!
//! Files drive the cycle themselves: reading past the preload threshold emits
//! `preload_next`, reading past the push threshold emits `preload_push`.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use bytes::{Bytes, BytesMut};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::{
    config::{ConfigSchema, Options},
    error::ConfigError,
    events::{
        AUDIOFILE, Event, EventManager, METADATA, PRELOAD_EXIT, PRELOAD_NEW_SONG, PRELOAD_NEXT,
        PRELOAD_PUSH,
    },
    garbage::Collector,
    manager::{Component, ComponentBuilder, Context},
    source::{AudioFile, DecoderFactory, DecoderFile, Song, SongQueue},
};

const PRELOAD_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PreloadOptions {
    /// Size of the look-ahead window.
    pub preload_amount: usize,
    /// While the window holds at most this many songs, new songs are
    /// buffered right away.
    pub preload_full_amount: usize,
    pub preload_percentage: f64,
    pub preload_push_percentage: f64,
}

impl Default for PreloadOptions {
    fn default() -> Self {
        Self {
            preload_amount: 5,
            preload_full_amount: 2,
            preload_percentage: 0.5,
            preload_push_percentage: 0.8,
        }
    }
}

impl PreloadOptions {
    pub fn schema() -> ConfigSchema {
        let defaults = Self::default();
        ConfigSchema::new()
            .field("preload_amount", defaults.preload_amount)
            .field("preload_full_amount", defaults.preload_full_amount)
            .field("preload_percentage", defaults.preload_percentage)
            .field("preload_push_percentage", defaults.preload_push_percentage)
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        Self::schema().resolve(options)?.parse()
    }
}

/// Turns read progress of one file into events, each at most once.
struct ReadTracker {
    events: Arc<EventManager>,
    metadata: String,
    preload_at: f64,
    push_at: f64,
    first_read: AtomicBool,
    preload_sent: AtomicBool,
    push_sent: AtomicBool,
}

impl ReadTracker {
    fn new(events: Arc<EventManager>, metadata: &str, options: &PreloadOptions) -> Self {
        Self {
            events,
            metadata: metadata.to_string(),
            preload_at: options.preload_percentage,
            push_at: options.preload_push_percentage,
            first_read: AtomicBool::new(true),
            preload_sent: AtomicBool::new(false),
            push_sent: AtomicBool::new(false),
        }
    }

    fn on_read(&self) {
        if self.first_read.swap(false, Ordering::SeqCst) {
            self.events
                .emit(METADATA, Event::Metadata(self.metadata.clone()));
        }
    }

    fn progress(&self, current: u64, total: u64) {
        let fraction = if total == 0 {
            1.0
        } else {
            current as f64 / total as f64
        };

        if fraction >= self.preload_at && !self.preload_sent.swap(true, Ordering::SeqCst) {
            self.events.emit(PRELOAD_NEXT, Event::Signal);
        }
        if fraction >= self.push_at && !self.push_sent.swap(true, Ordering::SeqCst) {
            self.events.emit(PRELOAD_PUSH, Event::Signal);
        }
    }

    fn finish(&self) {
        self.progress(1, 1);
    }
}

struct Loaded {
    data: Bytes,
    position: usize,
}

/// A window entry. Buffers its whole song in memory once asked to.
pub struct PreloadedAudioFile {
    song: Song,
    decoders: Arc<dyn DecoderFactory>,
    collector: Collector,
    events: Arc<EventManager>,
    options: PreloadOptions,
    tracker: ReadTracker,
    loaded: Mutex<Option<Loaded>>,
    finished: AtomicBool,
    closed: AtomicBool,
}

impl PreloadedAudioFile {
    pub fn new(
        song: Song,
        decoders: Arc<dyn DecoderFactory>,
        collector: Collector,
        events: Arc<EventManager>,
        options: &PreloadOptions,
    ) -> Self {
        Self {
            tracker: ReadTracker::new(Arc::clone(&events), &song.metadata, options),
            song,
            decoders,
            collector,
            events,
            options: options.clone(),
            loaded: Mutex::new(None),
            finished: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn song(&self) -> &Song {
        &self.song
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Decodes the whole song into memory. Blocks until done.
    pub fn preload(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut file = DecoderFile::new(
            self.song.filename.clone(),
            Arc::clone(&self.decoders),
            self.collector.clone(),
        );
        let mut buffer = BytesMut::new();
        loop {
            match file.read(PRELOAD_CHUNK) {
                Ok(outcome) if outcome.data.is_empty() => break,
                Ok(outcome) => buffer.extend_from_slice(&outcome.data),
                Err(e) => {
                    log::warn!("preloading {} failed: {:#}", self.song.metadata, e);
                    return;
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                log::debug!("preload of {} abandoned", self.song.metadata);
                return;
            }
        }

        let mut loaded = self.loaded.lock();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        *loaded = Some(Loaded {
            data: buffer.freeze(),
            position: 0,
        });
        self.finished.store(true, Ordering::SeqCst);
        log::debug!("preloaded {}", self.song.metadata);
    }

    /// A reader for the same song that decodes on demand instead.
    pub fn non_preload(&self) -> NormalAudioFile {
        NormalAudioFile::new(
            self.song.clone(),
            Arc::clone(&self.decoders),
            self.collector.clone(),
            Arc::clone(&self.events),
            &self.options,
        )
    }
}

impl AudioFile for PreloadedAudioFile {
    fn metadata(&self) -> &str {
        &self.song.metadata
    }

    fn read(&self, size: usize) -> anyhow::Result<Bytes> {
        self.tracker.on_read();

        let mut loaded = self.loaded.lock();
        let Some(loaded) = loaded.as_mut() else {
            self.tracker.finish();
            return Ok(Bytes::new());
        };

        let total = loaded.data.len();
        let end = loaded.position.saturating_add(size).min(total);
        let data = loaded.data.slice(loaded.position.min(end)..end);
        loaded.position = end;
        self.tracker.progress(end as u64, total as u64);
        Ok(data)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.loaded.lock().take();
    }
}

/// Fallback for an entry that was not buffered in time.
pub struct NormalAudioFile {
    metadata: String,
    file: Mutex<DecoderFile>,
    tracker: ReadTracker,
}

impl NormalAudioFile {
    pub fn new(
        song: Song,
        decoders: Arc<dyn DecoderFactory>,
        collector: Collector,
        events: Arc<EventManager>,
        options: &PreloadOptions,
    ) -> Self {
        Self {
            tracker: ReadTracker::new(events, &song.metadata, options),
            file: Mutex::new(DecoderFile::new(song.filename, decoders, collector)),
            metadata: song.metadata,
        }
    }
}

impl AudioFile for NormalAudioFile {
    fn metadata(&self) -> &str {
        &self.metadata
    }

    fn read(&self, size: usize) -> anyhow::Result<Bytes> {
        self.tracker.on_read();

        let outcome = self.file.lock().read(size)?;
        if outcome.data.is_empty() {
            self.tracker.finish();
        } else if let Some(total) = outcome.total {
            self.tracker.progress(outcome.position, total);
        }
        Ok(outcome.data)
    }

    fn close(&self) {
        self.file.lock().close();
    }
}

type Window = Arc<Mutex<VecDeque<Arc<PreloadedAudioFile>>>>;

struct BookKeeper {
    events: Arc<EventManager>,
    queue: Arc<dyn SongQueue>,
    decoders: Arc<dyn DecoderFactory>,
    collector: Collector,
    options: PreloadOptions,
    window: Window,
    next_preload: usize,
    first_song: bool,
}

impl BookKeeper {
    fn run(mut self, ready: Sender<()>) {
        let new_song = self.events.register(PRELOAD_NEW_SONG);
        let preload_next = self.events.register(PRELOAD_NEXT);
        let push = self.events.register(PRELOAD_PUSH);
        let exit = self.events.register(PRELOAD_EXIT);
        let started = self.events.register(METADATA);

        let _ = ready.send(());
        drop(ready);

        loop {
            crossbeam_channel::select! {
                recv(new_song.receiver()) -> msg => {
                    let Ok(_) = msg else { break };
                    self.new_song();
                }
                recv(preload_next.receiver()) -> msg => {
                    let Ok(_) = msg else { break };
                    self.preload_next();
                }
                recv(push.receiver()) -> msg => {
                    let Ok(_) = msg else { break };
                    self.push();
                }
                recv(started.receiver()) -> msg => {
                    let Ok(_) = msg else { break };
                    self.started();
                }
                recv(exit.receiver()) -> _ => {
                    self.exit();
                    break;
                }
            }
        }
        log::debug!("preload book-keeper stopped");
    }

    fn new_song(&mut self) {
        let index = self.window.lock().len();
        let Some(song) = self.queue.peek(index) else {
            log::debug!("song queue exhausted at {}", index);
            return;
        };
        log::debug!("adding new track: {}", song.metadata);

        let entry = Arc::new(PreloadedAudioFile::new(
            song,
            Arc::clone(&self.decoders),
            self.collector.clone(),
            Arc::clone(&self.events),
            &self.options,
        ));
        let len = {
            let mut window = self.window.lock();
            window.push_back(entry);
            window.len()
        };

        if len <= self.options.preload_full_amount {
            self.events.emit(PRELOAD_NEXT, Event::Signal);
        }
        if self.first_song {
            self.first_song = false;
            self.events.emit(PRELOAD_PUSH, Event::Signal);
        }
    }

    fn preload_next(&mut self) {
        let Some(entry) = self.window.lock().get(self.next_preload).cloned() else {
            log::debug!("nothing left to preload");
            return;
        };
        log::debug!("starting preload on: {}", entry.song().metadata);

        let spawned = thread::Builder::new()
            .name("preload".to_string())
            .spawn(move || entry.preload());
        if let Err(e) = spawned {
            log::error!("failed to start preload thread: {}", e);
        }
        self.next_preload += 1;
    }

    fn push(&mut self) {
        let Some(entry) = self.window.lock().front().cloned() else {
            log::debug!("push with an empty window");
            return;
        };

        let file: Arc<dyn AudioFile> = if entry.is_finished() {
            entry
        } else {
            log::debug!(
                "{} is not preloaded yet, handing out a direct reader",
                entry.song().metadata
            );
            Arc::new(entry.non_preload())
        };

        log::debug!("pushing audiofile: {}", file.metadata());
        self.events.emit(AUDIOFILE, Event::AudioFile(file));
        self.events.emit(PRELOAD_NEW_SONG, Event::Signal);
    }

    fn started(&mut self) {
        let song = self.queue.pop();
        self.window.lock().pop_front();
        self.next_preload = self.next_preload.saturating_sub(1);

        if let Some(song) = song {
            log::debug!("starting audiofile: {}", song.metadata);
        }
    }

    fn exit(&mut self) {
        for entry in self.window.lock().iter() {
            entry.close();
        }
    }
}

/// Component running the book-keeper against the manager's song queue.
pub struct PreloadedFileSource {
    events: Arc<EventManager>,
    queue: Arc<dyn SongQueue>,
    decoders: Arc<dyn DecoderFactory>,
    collector: Collector,
    options: PreloadOptions,
    window: Window,
    keeper: Mutex<Option<JoinHandle<()>>>,
}

impl PreloadedFileSource {
    pub fn new(
        context: &Context,
        decoders: Arc<dyn DecoderFactory>,
        options: PreloadOptions,
    ) -> anyhow::Result<Self> {
        let queue = context
            .source
            .clone()
            .ok_or_else(|| anyhow::anyhow!("preloading needs a song queue"))?;

        Ok(Self {
            events: Arc::clone(&context.events),
            queue,
            decoders,
            collector: context.collector.clone(),
            options,
            window: Window::default(),
            keeper: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.keeper.lock().is_some()
    }

    /// Songs currently in the look-ahead window, soonest first.
    pub fn window(&self) -> Vec<Song> {
        self.window
            .lock()
            .iter()
            .map(|entry| entry.song().clone())
            .collect()
    }
}

impl Component for PreloadedFileSource {
    fn start(&self) -> anyhow::Result<()> {
        let mut keeper = self.keeper.lock();
        if keeper.is_some() {
            return Ok(());
        }

        let book_keeper = BookKeeper {
            events: Arc::clone(&self.events),
            queue: Arc::clone(&self.queue),
            decoders: Arc::clone(&self.decoders),
            collector: self.collector.clone(),
            options: self.options.clone(),
            window: Arc::clone(&self.window),
            next_preload: 0,
            first_song: true,
        };

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let handle = thread::Builder::new()
            .name("preload-bookkeeper".to_string())
            .spawn(move || book_keeper.run(ready_tx))?;
        ready_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("preload book-keeper exited during startup"))?;

        for _ in 0..self.options.preload_amount {
            self.events.emit(PRELOAD_NEW_SONG, Event::Signal);
        }

        *keeper = Some(handle);
        log::info!(
            "preloading started, window of {} song(s)",
            self.options.preload_amount
        );
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        for entry in self.window.lock().iter() {
            entry.close();
        }
        self.events.emit(PRELOAD_EXIT, Event::Signal);

        if let Some(handle) = self.keeper.lock().take() {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("preload book-keeper panicked"))?;
        }
        Ok(())
    }
}

/// Builds a [`PreloadedFileSource`] from manager options.
pub struct PreloadedFileSourceBuilder {
    decoders: Arc<dyn DecoderFactory>,
}

impl PreloadedFileSourceBuilder {
    pub fn new(decoders: Arc<dyn DecoderFactory>) -> Self {
        Self { decoders }
    }
}

impl ComponentBuilder for PreloadedFileSourceBuilder {
    fn defaults(&self) -> Options {
        PreloadOptions::schema().defaults()
    }

    fn build(
        self: Box<Self>,
        context: &Context,
        _previous: Option<Arc<dyn Component>>,
        options: &Options,
    ) -> anyhow::Result<Arc<dyn Component>> {
        let options = PreloadOptions::from_options(options)?;
        Ok(Arc::new(PreloadedFileSource::new(
            context,
            self.decoders,
            options,
        )?))
    }
}

#[cfg(test)]
#[path = "preloader_test.rs"]
mod preloader_test;
