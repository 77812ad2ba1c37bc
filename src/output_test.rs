use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde_json::json;
use streamer_core::{
    config::Options,
    error::EncoderError,
    events::{AUDIOFILE, Event, EventManager},
    garbage::Collector,
    manager::{Component, Context},
    source::PlainAudioFile,
};
use tokio_util::sync::CancellationToken;

use super::FileOutput;
use crate::library::RawPcmDecoders;

fn unique_temp_dir(suffix: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let dir = std::env::temp_dir().join(format!(
        "streamer-output-test-{}-{ts}-{suffix}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn context() -> Context {
    Context {
        events: Arc::new(EventManager::new()),
        source: None,
        collector: Collector::new(Duration::from_millis(20)),
    }
}

fn is_missing_binary(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<EncoderError>(),
            Some(EncoderError::MissingBinary(_))
        )
    })
}

#[test]
fn test_registers_for_audio_files_when_built() {
    let context = context();
    let dir = unique_temp_dir("register");
    let _output = FileOutput::new(
        &context,
        dir.join("out.mp3"),
        Options::new(),
        CancellationToken::new(),
    );

    assert_eq!(context.events.subscribers(AUDIOFILE), 1);
}

#[test]
fn test_missing_lame_fails_start() {
    let context = context();
    let dir = unique_temp_dir("missing");
    let mut options = Options::new();
    options.insert("lame.binary".to_string(), json!("no-such-encoder-binary"));

    let output = FileOutput::new(
        &context,
        dir.join("out.mp3"),
        options,
        CancellationToken::new(),
    );

    let e = output.start().unwrap_err();
    assert!(is_missing_binary(&e), "unexpected error: {:#}", e);
    assert!(!output.path().exists());
    output.close().unwrap();
}

#[test]
fn test_close_without_start() {
    let context = context();
    let dir = unique_temp_dir("idle");
    let cancel = CancellationToken::new();
    let output = FileOutput::new(&context, dir.join("out.mp3"), Options::new(), cancel.clone());

    output.close().unwrap();

    assert!(cancel.is_cancelled());
    assert!(context.events.is_closed());
}

#[test]
fn test_encodes_pushed_files() -> anyhow::Result<()> {
    let context = context();
    let dir = unique_temp_dir("encode");
    let song = dir.join("song.pcm");
    std::fs::write(&song, vec![0u8; 44100 * 3])?;

    let cancel = CancellationToken::new();
    let output = FileOutput::new(&context, dir.join("out.mp3"), Options::new(), cancel.clone());
    match output.start() {
        Err(e) if is_missing_binary(&e) => {
            eprintln!("lame is not available, skipping");
            return Ok(());
        }
        result => result?,
    }

    let file = PlainAudioFile::open(&song, Arc::new(RawPcmDecoders), context.collector.clone())?;
    assert_eq!(
        context
            .events
            .emit(AUDIOFILE, Event::AudioFile(Arc::new(file))),
        1
    );

    // Give the worker time to push the song through before stopping it.
    std::thread::sleep(Duration::from_secs(1));
    output.close()?;

    assert!(cancel.is_cancelled());
    assert!(std::fs::metadata(output.path())?.len() > 0);
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
