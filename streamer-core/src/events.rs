use std::{collections::HashMap, fmt::Debug, sync::Arc, time::Duration};

use crossbeam_channel::{
    Receiver, RecvError, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError,
};
use parking_lot::Mutex;

use crate::source::AudioFile;

pub const PRELOAD_NEW_SONG: &str = "preload_new_song";
pub const PRELOAD_NEXT: &str = "preload_next";
pub const PRELOAD_PUSH: &str = "preload_push";
pub const PRELOAD_EXIT: &str = "preload_exit";
pub const METADATA: &str = "metadata";
pub const AUDIOFILE: &str = "audiofile";

pub const CHANNEL_CAPACITY: usize = 5;
/// How long `emit` waits on one full subscriber before dropping the event for it.
pub const EMIT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub enum Event {
    Signal,
    Metadata(String),
    AudioFile(Arc<dyn AudioFile>),
}

impl Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Signal => write!(f, "Signal"),
            Event::Metadata(metadata) => f.debug_tuple("Metadata").field(metadata).finish(),
            Event::AudioFile(file) => f.debug_tuple("AudioFile").field(&file.metadata()).finish(),
        }
    }
}

/// Receiving end of one registration.
pub struct Subscription {
    name: String,
    receiver: Receiver<Event>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn recv(&self) -> Result<Event, RecvError> {
        self.receiver.recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<Event, TryRecvError> {
        self.receiver.try_recv()
    }

    /// For use in `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<Event> {
        &self.receiver
    }

    /// Blocks on every event until the manager closes.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.receiver.iter()
    }

    /// Unsubscribes. The manager drops the channel at its next emit.
    pub fn close(self) {}
}

impl IntoIterator for Subscription {
    type Item = Event;
    type IntoIter = crossbeam_channel::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.receiver.into_iter()
    }
}

#[derive(Default)]
struct Channels {
    subscribers: HashMap<String, Vec<Sender<Event>>>,
    closed: bool,
}

/// Named, bounded, multi-subscriber channels.
///
/// Every [`EventManager::register`] call gets its own queue, so a slow or dead
/// subscriber never takes events away from the others.
#[derive(Default)]
pub struct EventManager {
    channels: Mutex<Channels>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) -> Subscription {
        let (sender, receiver) = crossbeam_channel::bounded(CHANNEL_CAPACITY);

        let mut channels = self.channels.lock();
        if channels.closed {
            log::debug!("register '{}' after close, returning a closed channel", name);
        } else {
            channels
                .subscribers
                .entry(name.to_string())
                .or_default()
                .push(sender);
        }

        Subscription {
            name: name.to_string(),
            receiver,
        }
    }

    /// Sends `event` to every subscriber of `name`, returning how many got it.
    ///
    /// A full subscriber is waited on for at most [`EMIT_TIMEOUT`]. Closed
    /// subscribers are unregistered.
    pub fn emit(&self, name: &str, event: Event) -> usize {
        let senders: Vec<Sender<Event>> = match self.channels.lock().subscribers.get(name) {
            Some(senders) => senders.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for sender in senders {
            match sender.send_timeout(event.clone(), EMIT_TIMEOUT) {
                Ok(()) => delivered += 1,
                Err(SendTimeoutError::Disconnected(_)) => dead.push(sender),
                Err(SendTimeoutError::Timeout(_)) => {
                    log::warn!("subscriber of '{}' is not keeping up, dropping {:?}", name, event)
                }
            }
        }

        if !dead.is_empty() {
            let mut channels = self.channels.lock();
            if let Some(senders) = channels.subscribers.get_mut(name) {
                senders.retain(|sender| !dead.iter().any(|d| d.same_channel(sender)));
            }
            log::debug!("removed {} closed subscriber(s) of '{}'", dead.len(), name);
        }

        delivered
    }

    pub fn subscribers(&self, name: &str) -> usize {
        self.channels
            .lock()
            .subscribers
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Disconnects every subscriber. Receivers drain what is queued, then
    /// see the channel as closed.
    pub fn close(&self) {
        let mut channels = self.channels.lock();
        if channels.closed {
            return;
        }
        channels.closed = true;
        channels.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.channels.lock().closed
    }
}

#[cfg(test)]
#[path = "events_test.rs"]
mod events_test;
