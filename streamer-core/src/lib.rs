//! Concurrency and resource-lifecycle core of the streamer.
//!
//! ```text
//!   SongQueue ──► PreloadedFileSource ──(audiofile)──► read_audio_files ──► encode_pcm_with_lame ──► sink
//!                      ▲      │                                                   │
//!        preload_* ────┘      └── decoders ──► Collector ◄── encoder processes ───┘
//! ```
//!
//! Stages are composed with [`engine::compose`], which threads an immutable
//! [`state::State`] alongside every item. Components that need to talk across
//! threads do so through a shared [`events::EventManager`]; resources with slow
//! teardown are handed to a [`garbage::Collector`].

pub mod buffered;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod events;
pub mod files;
pub mod garbage;
pub mod manager;
pub mod preloader;
pub mod source;
pub mod state;

#[cfg(test)]
mod testing;
