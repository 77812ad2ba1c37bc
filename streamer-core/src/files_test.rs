use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use bytes::Bytes;
use serde_json::json;

use super::{
    SharedAudioFile, audiofile_events, encode_pcm_with_lame, open_audio_files,
    read_audio_files, read_audio_metadata,
};
use crate::{
    config::Options,
    encoder::LameSettings,
    engine::{Stage, boxed, compose},
    error::{EncoderError, PipelineError},
    events::{AUDIOFILE, Event, EventManager},
    garbage::Collector,
    source::{MetadataReader, PlainAudioFile},
    testing::MemoryDecoders,
};

fn collector() -> Collector {
    Collector::new(Duration::from_millis(20))
}

fn filenames(names: &[&str]) -> Stage {
    let names: Vec<PathBuf> = names.iter().map(PathBuf::from).collect();
    Stage::plain("filenames", move |_, _| Ok(boxed(names.into_iter())))
        .output_of::<PathBuf>("filenames")
}

fn decoders() -> Arc<MemoryDecoders> {
    Arc::new(
        MemoryDecoders::default()
            .with_file("a.pcm", vec![1u8; 10])
            .with_file("b.pcm", vec![2u8; 6])
            .failing_after("broken.pcm", vec![3u8; 100], 4),
    )
}

struct Tags;

impl MetadataReader for Tags {
    fn read(&self, path: &Path) -> anyhow::Result<Option<BTreeMap<String, Vec<String>>>> {
        match path.to_str() {
            Some("tagged.flac") => Ok(Some(BTreeMap::from([
                ("artist".to_string(), vec!["A".to_string(), "B".to_string()]),
                ("title".to_string(), vec!["Song".to_string()]),
            ]))),
            Some("untagged.flac") => Ok(None),
            _ => anyhow::bail!("unreadable"),
        }
    }
}

#[test]
fn test_open_and_read_audio_files() {
    let chain = compose(
        vec![
            filenames(&["a.pcm", "cover.jpg", "b.pcm"]),
            open_audio_files(decoders(), collector()),
            read_audio_files(),
        ],
        &Options::new(),
    )
    .unwrap();

    let chunks: Vec<Bytes> = chain.payloads::<Bytes>().collect();
    assert_eq!(chunks.iter().map(Bytes::len).collect::<Vec<_>>(), vec![10, 6]);
    assert_eq!(&chunks[1][..], &[2u8; 6]);
}

#[test]
fn test_read_size_option_is_honored() {
    let mut options = Options::new();
    options.insert("read_size".to_string(), json!(4));

    let chain = compose(
        vec![
            filenames(&["a.pcm"]),
            open_audio_files(decoders(), collector()),
            read_audio_files(),
        ],
        &options,
    )
    .unwrap();

    let sizes: Vec<usize> = chain.payloads::<Bytes>().map(|chunk| chunk.len()).collect();
    assert_eq!(sizes, vec![4, 4, 2]);
}

#[test]
fn test_read_error_moves_on_to_next_file() {
    let mut options = Options::new();
    options.insert("read_size".to_string(), json!(4));

    let chain = compose(
        vec![
            filenames(&["broken.pcm", "b.pcm"]),
            open_audio_files(decoders(), collector()),
            read_audio_files(),
        ],
        &options,
    )
    .unwrap();

    let chunks: Vec<Bytes> = chain.payloads::<Bytes>().collect();
    assert_eq!(&chunks[0][..], &[3u8; 4]);
    assert_eq!(chunks[1..].concat(), vec![2u8; 6]);
}

#[test]
fn test_read_audio_metadata_records_state() {
    let chain = compose(
        vec![
            filenames(&["tagged.flac", "untagged.flac", "missing.flac"]),
            read_audio_metadata(Arc::new(Tags)),
        ],
        &Options::new(),
    )
    .unwrap();

    let states: Vec<_> = chain.map(|(state, _)| state).collect();
    assert_eq!(states.len(), 3);

    assert_eq!(states[0].get("filename").unwrap(), &json!("tagged.flac"));
    assert_eq!(
        states[0].get("metadata").unwrap(),
        &json!({ "artist": "A, B", "title": "Song" })
    );
    assert_eq!(states[1].get("filename").unwrap(), &json!("untagged.flac"));
    assert!(!states[1].contains("metadata"));
    assert_eq!(states[2].get("filename").unwrap(), &json!("missing.flac"));
    assert!(!states[2].contains("metadata"));
}

#[test]
fn test_audiofile_events_feed_the_pipeline() {
    let events = Arc::new(EventManager::new());
    let chain = compose(
        vec![audiofile_events(events.register(AUDIOFILE)), read_audio_files()],
        &Options::new(),
    )
    .unwrap();

    let publisher = {
        let events = Arc::clone(&events);
        thread::spawn(move || {
            let decoders = decoders();
            for name in ["a.pcm", "b.pcm"] {
                let file =
                    PlainAudioFile::open(Path::new(name), decoders.clone(), collector()).unwrap();
                events.emit(AUDIOFILE, Event::AudioFile(Arc::new(file) as SharedAudioFile));
            }
            events.emit(AUDIOFILE, Event::Metadata("not a file".to_string()));
            events.close();
        })
    };

    let data: Vec<u8> = chain
        .payloads::<Bytes>()
        .flat_map(|chunk| chunk.to_vec())
        .collect();
    publisher.join().unwrap();

    assert_eq!(data.len(), 16);
    assert_eq!(&data[10..], &[2u8; 6]);
}

#[test]
fn test_missing_lame_stops_composition() {
    let mut options = Options::new();
    options.insert("lame.binary".to_string(), json!("no-such-encoder-binary"));

    let pcm = Stage::plain("pcm", |_, _| Ok(boxed(std::iter::empty::<Bytes>())))
        .output_of::<Bytes>("audio_pcm_data");
    let result = compose(vec![pcm, encode_pcm_with_lame(collector())], &options);

    match result {
        Err(PipelineError::Stage { stage, source }) => {
            assert_eq!(stage, "encode_pcm_with_lame");
            assert!(matches!(
                source.downcast_ref::<EncoderError>(),
                Some(EncoderError::MissingBinary(_))
            ));
        }
        Err(other) => panic!("expected a stage error, got {}", other),
        Ok(_) => panic!("expected a stage error"),
    }
}

#[test]
fn test_encoder_stage_reads_lame_namespace() {
    let stage = encode_pcm_with_lame(collector());
    let config = stage
        .descriptor()
        .config
        .resolve(&Options::new())
        .unwrap();

    assert_eq!(config.parse::<LameSettings>().unwrap(), LameSettings::default());
    assert_eq!(stage.descriptor().config.name(), Some("lame"));
}
