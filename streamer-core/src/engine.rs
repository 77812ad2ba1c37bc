//! Stage composition.
//!
//! A [`Stage`] is a pull-driven transform from an input sequence to an output
//! sequence, described by a [`StageDescriptor`]. [`compose`] validates that
//! adjacent stages agree on what they exchange and chains them into a single
//! lazy [`Chain`]; nothing runs until the chain is iterated.
//!
//! Stages that do not consume state only ever see plain payloads. The engine
//! strips the [`State`] before such a stage and re-attaches the most recent
//! state to whatever the stage emits.

use std::{
    any::{Any, TypeId},
    fmt::{Debug, Display, Formatter},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    buffered::Buffered,
    config::{ConfigSchema, Options, StageConfig},
    error::PipelineError,
    state::State,
};

pub type Payload = Box<dyn Any + Send>;
pub type Items = Box<dyn Iterator<Item = Payload> + Send>;
pub type StatedItems = Box<dyn Iterator<Item = (State, Payload)> + Send>;

type PlainBody = Box<dyn FnOnce(Option<Items>, &StageConfig) -> anyhow::Result<Items> + Send>;
type StatedBody =
    Box<dyn FnOnce(Option<StatedItems>, &StageConfig) -> anyhow::Result<StatedItems> + Send>;

/// Runtime identity of the payload type a port carries.
#[derive(Clone, Copy)]
pub struct DataType {
    id: TypeId,
    name: &'static str,
}

impl DataType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for DataType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DataType {}

impl Debug for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataType({})", self.name)
    }
}

static NEXT_DEFAULT_NAME: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortName {
    Named(String),
    /// Filled in for ports the stage author left unnamed. Every default is
    /// unique, so an unnamed port never matches another port.
    Default(u64),
}

impl PortName {
    fn fresh_default() -> Self {
        PortName::Default(NEXT_DEFAULT_NAME.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for PortName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PortName::Named(name) => write!(f, "{}", name),
            PortName::Default(id) => write!(f, "<default #{}>", id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Port {
    pub name: Option<PortName>,
    /// `None` is untyped and only matches another untyped port.
    pub data_type: Option<DataType>,
}

impl Port {
    fn describe_name(&self) -> String {
        match &self.name {
            Some(name) => name.to_string(),
            None => "<unset>".to_string(),
        }
    }

    fn describe_type(&self) -> String {
        match &self.data_type {
            Some(data_type) => data_type.name().to_string(),
            None => "<untyped>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortField {
    Type,
    Name,
}

impl Display for PortField {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PortField::Type => write!(f, "type"),
            PortField::Name => write!(f, "name"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub name: String,
    pub input: Port,
    pub output: Port,
    pub consumes_state: bool,
    pub config: ConfigSchema,
}

impl StageDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            input: Port::default(),
            output: Port::default(),
            consumes_state: false,
            config: ConfigSchema::new(),
        }
    }

    /// Gives unnamed ports a unique default name. Fields set by the stage
    /// author are left alone.
    pub fn initialize(&mut self) {
        for port in [&mut self.input, &mut self.output] {
            if port.name.is_none() {
                port.name = Some(PortName::fresh_default());
            }
        }
    }
}

/// Checks every adjacent pair: the left output must equal the right input,
/// both in type and in name.
pub fn verify(descriptors: &[StageDescriptor]) -> Result<(), PipelineError> {
    if descriptors.is_empty() {
        return Err(PipelineError::Empty);
    }

    for pair in descriptors.windows(2) {
        let (producer, consumer) = (&pair[0], &pair[1]);

        if producer.output.data_type != consumer.input.data_type {
            return Err(PipelineError::Incompatible {
                field: PortField::Type,
                producer: producer.name.clone(),
                consumer: consumer.name.clone(),
                expected: consumer.input.describe_type(),
                actual: producer.output.describe_type(),
            });
        }

        if producer.output.name != consumer.input.name {
            return Err(PipelineError::Incompatible {
                field: PortField::Name,
                producer: producer.name.clone(),
                consumer: consumer.name.clone(),
                expected: consumer.input.describe_name(),
                actual: producer.output.describe_name(),
            });
        }
    }

    Ok(())
}

enum Body {
    Plain(PlainBody),
    Stated(StatedBody),
}

/// A stage descriptor bound to its implementation.
///
/// The body receives `None` when it is the first stage of a pipeline.
pub struct Stage {
    descriptor: StageDescriptor,
    body: Body,
    /// `(buffer_size, chunk_size)` when the stage runs on its own thread.
    buffering: Option<(usize, usize)>,
}

impl Stage {
    pub fn plain<F>(name: &str, body: F) -> Self
    where
        F: FnOnce(Option<Items>, &StageConfig) -> anyhow::Result<Items> + Send + 'static,
    {
        Self {
            descriptor: StageDescriptor::new(name),
            body: Body::Plain(Box::new(body)),
            buffering: None,
        }
    }

    pub fn stated<F>(name: &str, body: F) -> Self
    where
        F: FnOnce(Option<StatedItems>, &StageConfig) -> anyhow::Result<StatedItems>
            + Send
            + 'static,
    {
        let mut descriptor = StageDescriptor::new(name);
        descriptor.consumes_state = true;
        Self {
            descriptor,
            body: Body::Stated(Box::new(body)),
            buffering: None,
        }
    }

    pub fn input(mut self, name: &str) -> Self {
        self.descriptor.input.name = Some(PortName::Named(name.to_string()));
        self
    }

    pub fn input_of<T: 'static>(mut self, name: &str) -> Self {
        self.descriptor.input.data_type = Some(DataType::of::<T>());
        self.input(name)
    }

    pub fn output(mut self, name: &str) -> Self {
        self.descriptor.output.name = Some(PortName::Named(name.to_string()));
        self
    }

    pub fn output_of<T: 'static>(mut self, name: &str) -> Self {
        self.descriptor.output.data_type = Some(DataType::of::<T>());
        self.output(name)
    }

    pub fn config(mut self, schema: ConfigSchema) -> Self {
        self.descriptor.config = schema;
        self
    }

    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    /// Runs this stage on its own thread, handing its output over in batches
    /// of `chunk_size` through a queue holding at most `buffer_size` batches.
    ///
    /// The queue carries items together with their state, so a state-oblivious
    /// stage still hands every item on with its own state.
    pub fn buffered(mut self, buffer_size: usize, chunk_size: usize) -> Self {
        self.buffering = Some((buffer_size, chunk_size));
        self
    }
}

/// The most recent state seen in front of a state-oblivious stage.
#[derive(Default)]
struct LastState {
    slot: Arc<Mutex<State>>,
}

impl LastState {
    fn strip(&self, upstream: StatedItems) -> Items {
        let slot = Arc::clone(&self.slot);
        Box::new(upstream.map(move |(state, data)| {
            *slot.lock() = state;
            data
        }))
    }

    fn attach(self, output: Items) -> StatedItems {
        Box::new(output.map(move |data| (self.slot.lock().clone(), data)))
    }
}

fn with_fresh_state(items: Items) -> StatedItems {
    Box::new(items.map(|data| (State::default(), data)))
}

fn skip_state(
    body: PlainBody,
    upstream: Option<StatedItems>,
    config: &StageConfig,
) -> anyhow::Result<StatedItems> {
    let last = LastState::default();
    let stripped = upstream.map(|items| last.strip(items));
    let output = body(stripped, config)?;
    Ok(last.attach(output))
}

/// Validates `stages` and chains them into one lazy sequence.
///
/// Each stage's config is its schema defaults overridden by `options`.
pub fn compose(stages: Vec<Stage>, options: &Options) -> Result<Chain, PipelineError> {
    let mut stages = stages;
    for stage in &mut stages {
        stage.descriptor.initialize();
    }

    let descriptors: Vec<StageDescriptor> =
        stages.iter().map(|stage| stage.descriptor.clone()).collect();
    verify(&descriptors)?;

    let mut upstream: Option<StatedItems> = None;
    for (index, stage) in stages.into_iter().enumerate() {
        let Stage {
            descriptor,
            body,
            buffering,
        } = stage;
        let config =
            descriptor
                .config
                .resolve(options)
                .map_err(|source| PipelineError::Config {
                    stage: descriptor.name.clone(),
                    source,
                })?;

        let started = match body {
            Body::Stated(body) => body(upstream.take(), &config),
            Body::Plain(body) if index == 0 => body(None, &config).map(with_fresh_state),
            Body::Plain(body) => skip_state(body, upstream.take(), &config),
        };

        let started = started.and_then(|items| match buffering {
            Some((buffer_size, chunk_size)) => {
                let thread_name = format!("stage-{}", descriptor.name);
                let buffered = Buffered::spawn(&thread_name, items, buffer_size, chunk_size)?;
                Ok(Box::new(buffered) as StatedItems)
            }
            None => Ok(items),
        });

        upstream = Some(started.map_err(|source| PipelineError::Stage {
            stage: descriptor.name.clone(),
            source,
        })?);
        log::debug!("pipeline stage {} ready: {}", index, descriptor.name);
    }

    let items = upstream.ok_or(PipelineError::Empty)?;
    Ok(Chain { items })
}

/// A composed pipeline. Pulling from it drives every stage.
pub struct Chain {
    items: StatedItems,
}

impl Chain {
    /// Drops the state and downcasts every payload to `T`.
    pub fn payloads<T: Send + 'static>(self) -> impl Iterator<Item = T> + Send {
        downcast(Box::new(self.items.map(|(_, data)| data)))
    }

    /// Drives the chain to completion, returning the number of items produced.
    pub fn run(self) -> usize {
        self.count()
    }
}

impl Iterator for Chain {
    type Item = (State, Payload);

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }
}

/// Consumes a sequence for its side effects.
pub fn consume<I: IntoIterator>(items: I) {
    items.into_iter().for_each(drop);
}

/// Boxes every item of `items` into a [`Payload`].
pub fn boxed<I, T>(items: I) -> Items
where
    I: Iterator<Item = T> + Send + 'static,
    T: Send + 'static,
{
    Box::new(items.map(|item| Box::new(item) as Payload))
}

pub fn boxed_stated<I, T>(items: I) -> StatedItems
where
    I: Iterator<Item = (State, T)> + Send + 'static,
    T: Send + 'static,
{
    Box::new(items.map(|(state, item)| (state, Box::new(item) as Payload)))
}

/// Unboxes payloads of type `T`. Payloads of any other type are dropped and
/// logged; composition already rejects mismatched typed ports.
pub fn downcast<T: Send + 'static>(items: Items) -> impl Iterator<Item = T> + Send {
    items.filter_map(|data| match data.downcast::<T>() {
        Ok(item) => Some(*item),
        Err(_) => {
            log::error!(
                "dropping payload that is not a {}",
                std::any::type_name::<T>()
            );
            None
        }
    })
}

pub fn downcast_stated<T: Send + 'static>(
    items: StatedItems,
) -> impl Iterator<Item = (State, T)> + Send {
    items.filter_map(|(state, data)| match data.downcast::<T>() {
        Ok(item) => Some((state, *item)),
        Err(_) => {
            log::error!(
                "dropping payload that is not a {}",
                std::any::type_name::<T>()
            );
            None
        }
    })
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod engine_test;
