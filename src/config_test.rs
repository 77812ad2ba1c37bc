use std::path::{Path, PathBuf};

use serde_json::json;

use super::{StreamerConfig, config_path};

#[test]
fn test_config_path_precedence() {
    assert_eq!(
        config_path(Some("a.json".to_string()), Some("b.json".to_string())),
        PathBuf::from("a.json")
    );
    assert_eq!(config_path(None, Some("b.json".to_string())), PathBuf::from("b.json"));
    assert_eq!(config_path(None, None), PathBuf::from("streamer.json"));
}

#[test]
fn test_partial_config_keeps_defaults() -> anyhow::Result<()> {
    let config = StreamerConfig::from_json(
        r#"{ "directory": "/srv/music", "options": { "preload_amount": 3, "lame.bitrate": 128 } }"#,
    )?;

    assert_eq!(config.directory, PathBuf::from("/srv/music"));
    assert_eq!(config.output, StreamerConfig::default().output);
    assert_eq!(config.options["preload_amount"], json!(3));
    assert_eq!(config.options["lame.bitrate"], json!(128));
    Ok(())
}

#[test]
fn test_missing_file_uses_defaults() -> anyhow::Result<()> {
    let config = StreamerConfig::load(Path::new("/nonexistent/streamer.json"))?;
    assert_eq!(config, StreamerConfig::default());
    Ok(())
}

#[test]
fn test_invalid_json_is_an_error() {
    assert!(StreamerConfig::from_json("{ \"directory\": 5 }").is_err());
}
