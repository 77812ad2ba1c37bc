//! MP3 encoding through an external `lame` process.
//!
//! A [`Session`] owns one process and exchanges bytes with it one [`Step`] at
//! a time. Every step reports how the caller has to continue:
//!
//! - [`Status::NoErr`]: carry on with the next input.
//! - [`Status::NeedMoreData`]: nothing to read yet, send more input.
//! - [`Status::RetryWithSameData`]: the input was not taken, send it again.
//! - [`Status::Fatal`]: the process is gone, start a new session.
//!
//! [`LameEncoder`] implements that contract over an iterator of PCM chunks.

use std::{process::Stdio, sync::Arc, time::Duration};

use bytes::{Buf, Bytes, BytesMut};
use futures::FutureExt;
use serde::Deserialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, ChildStdout, Command},
    runtime::Runtime,
};

use crate::{
    config::ConfigSchema,
    error::EncoderError,
    garbage::{Collector, Garbage},
};

/// Empty output of a step.
pub const NO_DATA: Bytes = Bytes::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    NoErr,
    NeedMoreData,
    RetryWithSameData,
    Fatal(String),
}

#[derive(Debug, Clone, Copy)]
pub enum Input<'a> {
    Data(&'a [u8]),
    /// No input will follow. Flush, then stop.
    NoMoreData,
    /// Stop right away.
    CleanUp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub output: Bytes,
    pub status: Status,
}

impl Step {
    fn new(output: Bytes, status: Status) -> Self {
        Self { output, status }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LameSettings {
    pub binary: String,
    /// Seconds a step waits for either pipe to become ready.
    pub select_timeout: f64,
    pub read_size: usize,
    pub bitrate: u32,
    pub sample_rate: u32,
    pub source_sample_rate: u32,
    pub source_bits_per_sample: u32,
    /// `j`oint stereo, `s`tereo, `m`ono, ...
    pub mode: String,
    /// Unsuccessful reaping attempts before the process is killed.
    pub kill_after: u32,
}

impl Default for LameSettings {
    fn default() -> Self {
        Self {
            binary: "lame".to_string(),
            select_timeout: 3.0,
            read_size: 4096,
            bitrate: 192,
            sample_rate: 44100,
            source_sample_rate: 44100,
            source_bits_per_sample: 24,
            mode: "j".to_string(),
            kill_after: 3,
        }
    }
}

impl LameSettings {
    pub fn schema() -> ConfigSchema {
        let defaults = Self::default();
        ConfigSchema::new()
            .named("lame")
            .field("binary", defaults.binary)
            .field("select_timeout", defaults.select_timeout)
            .field("read_size", defaults.read_size)
            .field("bitrate", defaults.bitrate)
            .field("sample_rate", defaults.sample_rate)
            .field("source_sample_rate", defaults.source_sample_rate)
            .field("source_bits_per_sample", defaults.source_bits_per_sample)
            .field("mode", defaults.mode)
            .field("kill_after", defaults.kill_after)
    }

    /// Raw little-endian signed PCM in on stdin, constant bitrate MP3 out on stdout.
    pub fn arguments(&self) -> Vec<String> {
        vec![
            "--quiet".to_string(),
            "--flush".to_string(),
            "-r".to_string(),
            "-s".to_string(),
            khz(self.source_sample_rate),
            "--bitwidth".to_string(),
            self.source_bits_per_sample.to_string(),
            "--signed".to_string(),
            "--little-endian".to_string(),
            "-m".to_string(),
            self.mode.clone(),
            "--cbr".to_string(),
            "-b".to_string(),
            self.bitrate.to_string(),
            "--resample".to_string(),
            khz(self.sample_rate),
            "-".to_string(),
            "-".to_string(),
        ]
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.select_timeout.max(0.0))
    }
}

/// Formats a sample rate in kHz the way lame expects it: `44100` is `44.1`.
pub fn khz(rate: u32) -> String {
    let (whole, fraction) = (rate / 1000, rate % 1000);
    if fraction == 0 {
        return whole.to_string();
    }
    let fraction = format!("{:03}", fraction);
    format!("{}.{}", whole, fraction.trim_end_matches('0'))
}

/// An encoder process that still has to be reaped.
pub struct SubprocessGarbage {
    runtime: Arc<Runtime>,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    attempts: u32,
    kill_after: u32,
}

impl Garbage for SubprocessGarbage {
    fn collect(&mut self) -> anyhow::Result<bool> {
        let _guard = self.runtime.enter();

        // Closing our ends lets the encoder see EOF and exit.
        self.stdin.take();
        self.stdout.take();

        if let Some(status) = self.child.try_wait()? {
            log::debug!("encoder process exited: {}", status);
            return Ok(true);
        }

        self.attempts += 1;
        if self.attempts >= self.kill_after {
            log::warn!(
                "encoder process still running after {} attempts, killing it",
                self.attempts
            );
            self.child.start_kill()?;
        }
        Ok(false)
    }
}

enum Ready {
    Read(std::io::Result<usize>),
    Write(std::io::Result<usize>),
    Timeout,
}

/// One running encoder process.
///
/// Input that the process only partly accepted is kept in an internal backlog
/// and flushed ahead of any new input; until it is gone, new input is answered
/// with [`Status::RetryWithSameData`].
pub struct Session {
    runtime: Arc<Runtime>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    backlog: BytesMut,
    timeout: Duration,
    read_size: usize,
    kill_after: u32,
    collector: Collector,
}

impl Session {
    pub fn spawn(settings: &LameSettings, collector: Collector) -> Result<Self, EncoderError> {
        Self::launch(&settings.binary, &settings.arguments(), settings, collector)
    }

    pub(crate) fn launch(
        program: &str,
        args: &[String],
        settings: &LameSettings,
        collector: Collector,
    ) -> Result<Self, EncoderError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(EncoderError::Runtime)?;

        let mut child = {
            let _guard = runtime.enter();
            Command::new(program)
                .args(args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|source| match source.kind() {
                    std::io::ErrorKind::NotFound => {
                        EncoderError::MissingBinary(program.to_string())
                    }
                    _ => EncoderError::Spawn {
                        program: program.to_string(),
                        source,
                    },
                })?
        };
        log::debug!("started encoder: {} {}", program, args.join(" "));

        Ok(Self {
            runtime: Arc::new(runtime),
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child: Some(child),
            backlog: BytesMut::new(),
            timeout: settings.timeout(),
            read_size: settings.read_size.max(1),
            kill_after: settings.kill_after,
            collector,
        })
    }

    pub fn step(&mut self, input: Input<'_>) -> Step {
        match input {
            Input::Data(data) => self.exchange(data),
            Input::NoMoreData => self.drain(),
            Input::CleanUp => {
                self.release();
                Step::new(NO_DATA, Status::NoErr)
            }
        }
    }

    /// Bytes accepted from the caller but not written to the process yet.
    pub fn pending(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_released(&self) -> bool {
        self.child.is_none()
    }

    fn exchange(&mut self, data: &[u8]) -> Step {
        let (Some(stdin), Some(stdout)) = (self.stdin.as_mut(), self.stdout.as_mut()) else {
            let reason = "encoder session is closed".to_string();
            return Step::new(NO_DATA, Status::Fatal(reason));
        };

        let flushing = !self.backlog.is_empty();
        let pending: &[u8] = if flushing { &self.backlog } else { data };
        let mut buffer = vec![0u8; self.read_size];
        let timeout = self.timeout;

        let (read, written) = self.runtime.block_on(async {
            let ready = tokio::select! {
                read = stdout.read(&mut buffer) => Ready::Read(read),
                written = stdin.write(pending), if !pending.is_empty() => Ready::Write(written),
                _ = tokio::time::sleep(timeout) => Ready::Timeout,
            };

            // Give the other pipe a chance too, without waiting on it.
            match ready {
                Ready::Read(read) => {
                    let written = if pending.is_empty() {
                        None
                    } else {
                        stdin.write(pending).now_or_never()
                    };
                    (Some(read), written)
                }
                Ready::Write(written) => (stdout.read(&mut buffer).now_or_never(), Some(written)),
                Ready::Timeout => (None, None),
            }
        });

        let mut fatal = None;
        let output = match read {
            Some(Ok(0)) => {
                fatal = Some("encoder closed its output".to_string());
                NO_DATA
            }
            Some(Ok(n)) => Bytes::copy_from_slice(&buffer[..n]),
            Some(Err(e)) => {
                fatal = Some(format!("reading from encoder failed: {}", e));
                NO_DATA
            }
            None => NO_DATA,
        };

        let consumed = match written {
            Some(Ok(n)) if flushing => {
                self.backlog.advance(n);
                false
            }
            Some(Ok(n)) => {
                if n < data.len() {
                    self.backlog.extend_from_slice(&data[n..]);
                }
                true
            }
            Some(Err(e)) => {
                if fatal.is_none() {
                    fatal = Some(format!("writing to encoder failed: {}", e));
                }
                false
            }
            None => !flushing && data.is_empty(),
        };

        let status = if let Some(reason) = fatal {
            log::warn!("encoder session failed: {}", reason);
            self.release();
            Status::Fatal(reason)
        } else if !consumed {
            Status::RetryWithSameData
        } else if output.is_empty() {
            Status::NeedMoreData
        } else {
            Status::NoErr
        };

        Step::new(output, status)
    }

    /// Flushes the backlog, closes stdin and reads what the process still has.
    /// Reports [`Status::NeedMoreData`] once nothing more will come.
    fn drain(&mut self) -> Step {
        let Some(stdout) = self.stdout.as_mut() else {
            return Step::new(NO_DATA, Status::NeedMoreData);
        };
        let timeout = self.timeout;
        let mut buffer = vec![0u8; self.read_size];

        let backlog = std::mem::take(&mut self.backlog);
        if let Some(mut stdin) = self.stdin.take() {
            let flushed = self.runtime.block_on(async {
                tokio::time::timeout(timeout, async {
                    stdin.write_all(&backlog).await?;
                    stdin.shutdown().await
                })
                .await
            });
            match flushed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("flushing encoder input failed: {}", e),
                Err(_) => log::warn!(
                    "flushing encoder input timed out, dropping {} bytes",
                    backlog.len()
                ),
            }
        }

        let read = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, stdout.read(&mut buffer)).await });

        match read {
            Ok(Ok(n)) if n > 0 => Step::new(Bytes::copy_from_slice(&buffer[..n]), Status::NoErr),
            Ok(Ok(_)) | Err(_) => {
                self.release();
                Step::new(NO_DATA, Status::NeedMoreData)
            }
            Ok(Err(e)) => {
                let reason = format!("reading from encoder failed: {}", e);
                log::warn!("encoder session failed: {}", reason);
                self.release();
                Step::new(NO_DATA, Status::Fatal(reason))
            }
        }
    }

    /// Hands the process to the collector. Idempotent.
    fn release(&mut self) {
        let Some(child) = self.child.take() else {
            return;
        };
        self.collector.register(SubprocessGarbage {
            runtime: Arc::clone(&self.runtime),
            child,
            stdin: self.stdin.take(),
            stdout: self.stdout.take(),
            attempts: 0,
            kill_after: self.kill_after,
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

type Launcher = fn(&LameSettings, &Collector) -> Result<Session, EncoderError>;

fn spawn_session(settings: &LameSettings, collector: &Collector) -> Result<Session, EncoderError> {
    Session::spawn(settings, collector.clone())
}

enum Phase {
    Encoding,
    Draining,
    Done,
}

/// Encodes a stream of PCM chunks into a stream of MP3 chunks.
///
/// A failed process is replaced with a new one for the following input; the
/// chunk that was being written when it failed is lost.
pub struct LameEncoder<I> {
    upstream: I,
    settings: LameSettings,
    collector: Collector,
    launcher: Launcher,
    session: Option<Session>,
    current: Option<Bytes>,
    phase: Phase,
}

impl<I: Iterator<Item = Bytes>> LameEncoder<I> {
    /// Starts the first process right away so a missing binary is reported
    /// before any audio flows.
    pub fn new(
        upstream: I,
        settings: LameSettings,
        collector: Collector,
    ) -> Result<Self, EncoderError> {
        Self::with_launcher(upstream, settings, collector, spawn_session)
    }

    pub(crate) fn with_launcher(
        upstream: I,
        settings: LameSettings,
        collector: Collector,
        launcher: Launcher,
    ) -> Result<Self, EncoderError> {
        let session = launcher(&settings, &collector)?;
        Ok(Self {
            upstream,
            settings,
            collector,
            launcher,
            session: Some(session),
            current: None,
            phase: Phase::Encoding,
        })
    }
}

impl<I: Iterator<Item = Bytes>> Iterator for LameEncoder<I> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        loop {
            match self.phase {
                Phase::Done => return None,
                Phase::Draining => {
                    let Some(session) = self.session.as_mut() else {
                        self.phase = Phase::Done;
                        continue;
                    };
                    let step = session.step(Input::NoMoreData);
                    if step.status != Status::NoErr {
                        self.session = None;
                        self.phase = Phase::Done;
                    }
                    if !step.output.is_empty() {
                        return Some(step.output);
                    }
                }
                Phase::Encoding => {
                    if self.current.is_none() {
                        match self.upstream.next() {
                            Some(chunk) => self.current = Some(chunk),
                            None => {
                                self.phase = Phase::Draining;
                                continue;
                            }
                        }
                    }

                    if self.session.is_none() {
                        match (self.launcher)(&self.settings, &self.collector) {
                            Ok(session) => self.session = Some(session),
                            Err(e) => {
                                log::error!("could not restart the encoder: {}", e);
                                self.phase = Phase::Done;
                                continue;
                            }
                        }
                    }

                    let (Some(session), Some(chunk)) =
                        (self.session.as_mut(), self.current.as_ref())
                    else {
                        continue;
                    };
                    let step = session.step(Input::Data(&chunk[..]));
                    match step.status {
                        Status::RetryWithSameData => {}
                        Status::NoErr | Status::NeedMoreData => self.current = None,
                        Status::Fatal(reason) => {
                            log::warn!("dropping encoder after failure: {}", reason);
                            self.session = None;
                            self.current = None;
                        }
                    }
                    if !step.output.is_empty() {
                        return Some(step.output);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
