//! Stages that turn songs into PCM and PCM into MP3.
//!
//! Port names used between them:
//!
//! - `filenames`: [`PathBuf`]
//! - `audiofile`: `Arc<dyn AudioFile>`
//! - `audio_pcm_data` and `audio_mp3_data`: [`Bytes`]

use std::{path::PathBuf, sync::Arc};

use bytes::Bytes;
use serde_json::Value;

use crate::{
    config::ConfigSchema,
    encoder::{LameEncoder, LameSettings},
    engine::{Stage, boxed, boxed_stated, downcast, downcast_stated},
    events::{Event, Subscription},
    garbage::Collector,
    source::{AudioFile, DecoderFactory, MetadataReader, PlainAudioFile},
};

pub type SharedAudioFile = Arc<dyn AudioFile>;

/// Emits every audio file published on the subscribed event.
pub fn audiofile_events(subscription: Subscription) -> Stage {
    Stage::plain("audiofile_events", move |_, _| {
        let files = subscription.into_iter().filter_map(|event| match event {
            Event::AudioFile(file) => Some(file),
            other => {
                log::debug!("ignoring {:?} on the audiofile channel", other);
                None
            }
        });
        Ok(boxed(files))
    })
    .output_of::<SharedAudioFile>("audiofile")
}

/// Opens filenames as audio files. Files no decoder accepts are skipped.
pub fn open_audio_files(decoders: Arc<dyn DecoderFactory>, collector: Collector) -> Stage {
    Stage::plain("open_audio_files", move |input, _| {
        let filenames = input.ok_or_else(|| anyhow::anyhow!("open_audio_files needs filenames"))?;
        let files = downcast::<PathBuf>(filenames).filter_map(move |filename| {
            match PlainAudioFile::open(&filename, Arc::clone(&decoders), collector.clone()) {
                Ok(file) => Some(Arc::new(file) as SharedAudioFile),
                Err(e) => {
                    log::debug!("skipping {}: {:#}", filename.display(), e);
                    None
                }
            }
        });
        Ok(boxed(files))
    })
    .input_of::<PathBuf>("filenames")
    .output_of::<SharedAudioFile>("audiofile")
}

/// Records `filename` and, when the file has tags, `metadata` into the state.
/// Tags with several values are joined with `, `.
pub fn read_audio_metadata(reader: Arc<dyn MetadataReader>) -> Stage {
    Stage::stated("read_audio_metadata", move |input, _| {
        let items = input.ok_or_else(|| anyhow::anyhow!("read_audio_metadata needs filenames"))?;
        let items = downcast_stated::<PathBuf>(items).map(move |(state, filename)| {
            let state = state.mutate([("filename", filename.display().to_string())]);

            let tags = match reader.read(&filename) {
                Ok(Some(tags)) if !tags.is_empty() => tags,
                Ok(_) => return (state, filename),
                Err(e) => {
                    log::debug!("no metadata for {}: {:#}", filename.display(), e);
                    return (state, filename);
                }
            };

            let metadata: serde_json::Map<String, Value> = tags
                .into_iter()
                .map(|(key, values)| (key, Value::String(values.join(", "))))
                .collect();
            (state.mutate([("metadata", Value::Object(metadata))]), filename)
        });
        Ok(boxed_stated(items))
    })
    .input_of::<PathBuf>("filenames")
    .output_of::<PathBuf>("filenames")
}

/// Reads every audio file to its end in chunks of `read_size` bytes. A read
/// error ends the current file; the stream continues with the next one.
pub fn read_audio_files() -> Stage {
    Stage::plain("read_audio_files", |input, config| {
        let read_size: usize = config.get("read_size")?;
        let files = input.ok_or_else(|| anyhow::anyhow!("read_audio_files needs audio files"))?;
        let chunks = downcast::<SharedAudioFile>(files).flat_map(move |file| {
            std::iter::from_fn(move || match file.read(read_size) {
                Ok(data) if data.is_empty() => None,
                Ok(data) => Some(data),
                Err(e) => {
                    log::warn!("stopped reading {}: {:#}", file.metadata(), e);
                    file.close();
                    None
                }
            })
        });
        Ok(boxed(chunks))
    })
    .input_of::<SharedAudioFile>("audiofile")
    .output_of::<Bytes>("audio_pcm_data")
    .config(ConfigSchema::new().field("read_size", 4096))
}

/// Encodes PCM to MP3 through lame. Options are read from the `lame.` namespace.
pub fn encode_pcm_with_lame(collector: Collector) -> Stage {
    Stage::plain("encode_pcm_with_lame", move |input, config| {
        let settings: LameSettings = config.parse()?;
        let pcm = input.ok_or_else(|| anyhow::anyhow!("encode_pcm_with_lame needs PCM data"))?;
        let encoder = LameEncoder::new(downcast::<Bytes>(pcm), settings, collector)?;
        Ok(boxed(encoder))
    })
    .input_of::<Bytes>("audio_pcm_data")
    .output_of::<Bytes>("audio_mp3_data")
    .config(LameSettings::schema())
}

#[cfg(test)]
#[path = "files_test.rs"]
mod files_test;
