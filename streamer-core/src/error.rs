use crate::engine::PortField;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state has no field '{0}'")]
    MissingField(String),

    #[error("state field '{field}' has an unexpected shape: {source}")]
    InvalidField {
        field: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required option '{0}'")]
    Missing(String),

    #[error("option '{field}' is invalid: {source}")]
    Invalid {
        field: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("a pipeline needs at least one stage")]
    Empty,

    /// Adjacent stages disagree on the data passed between them.
    #[error(
        "incompatible output/input {field} found: (output: {actual} from {producer}) (input: {expected} to {consumer})"
    )]
    Incompatible {
        field: PortField,
        producer: String,
        consumer: String,
        expected: String,
        actual: String,
    },

    #[error("stage '{stage}' has an invalid configuration: {source}")]
    Config {
        stage: String,
        #[source]
        source: ConfigError,
    },

    #[error("stage '{stage}' failed to start: {source}")]
    Stage {
        stage: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    /// The encoder executable could not be located. Reported once at startup.
    #[error("encoder binary '{0}' was not found, is it installed?")]
    MissingBinary(String),

    #[error("failed to launch encoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build the encoder runtime: {0}")]
    Runtime(#[source] std::io::Error),
}
