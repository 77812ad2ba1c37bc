use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    config::Options,
    events::{Event, EventManager, Subscription},
    garbage::Collector,
    source::SongQueue,
};

/// A long-running part of the streamer, driven by a [`Manager`].
pub trait Component: Send + Sync {
    fn start(&self) -> anyhow::Result<()>;
    fn close(&self) -> anyhow::Result<()>;
}

/// What every component is built against.
#[derive(Clone)]
pub struct Context {
    pub events: Arc<EventManager>,
    /// `None` when songs reach the components through events instead.
    pub source: Option<Arc<dyn SongQueue>>,
    pub collector: Collector,
}

pub trait ComponentBuilder: Send {
    /// Options this component falls back to. Manager options take precedence.
    fn defaults(&self) -> Options {
        Options::new()
    }

    fn build(
        self: Box<Self>,
        context: &Context,
        previous: Option<Arc<dyn Component>>,
        options: &Options,
    ) -> anyhow::Result<Arc<dyn Component>>;
}

impl<F> ComponentBuilder for F
where
    F: FnOnce(&Context, Option<Arc<dyn Component>>, &Options) -> anyhow::Result<Arc<dyn Component>>
        + Send,
{
    fn build(
        self: Box<Self>,
        context: &Context,
        previous: Option<Arc<dyn Component>>,
        options: &Options,
    ) -> anyhow::Result<Arc<dyn Component>> {
        (*self)(context, previous, options)
    }
}

/// Builds components in order, each wired to the one before it, and runs
/// their lifecycle.
pub struct Manager {
    context: Context,
    options: Options,
    components: Vec<Arc<dyn Component>>,
    started: Mutex<bool>,
}

impl Manager {
    pub fn new(
        source: Option<Arc<dyn SongQueue>>,
        builders: Vec<Box<dyn ComponentBuilder>>,
        options: Options,
    ) -> anyhow::Result<Self> {
        Self::with_collector(source, builders, options, Collector::global())
    }

    pub fn with_collector(
        source: Option<Arc<dyn SongQueue>>,
        builders: Vec<Box<dyn ComponentBuilder>>,
        options: Options,
        collector: Collector,
    ) -> anyhow::Result<Self> {
        let context = Context {
            events: Arc::new(EventManager::new()),
            source,
            collector,
        };

        let mut components: Vec<Arc<dyn Component>> = Vec::with_capacity(builders.len());
        for builder in builders {
            let mut merged = builder.defaults();
            merged.extend(options.clone());

            let previous = components.last().cloned();
            components.push(builder.build(&context, previous, &merged)?);
        }
        log::debug!("manager built {} component(s)", components.len());

        Ok(Self {
            context,
            options,
            components,
            started: Mutex::new(false),
        })
    }

    /// Starts every component in order. Does nothing while already started.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut started = self.started.lock();
        if *started {
            return Ok(());
        }
        for component in &self.components {
            component.start()?;
        }
        *started = true;
        Ok(())
    }

    /// Closes every component in order, then every event channel.
    pub fn close(&self) -> anyhow::Result<()> {
        *self.started.lock() = false;
        for component in &self.components {
            component.close()?;
        }
        self.context.events.close();
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        *self.started.lock()
    }

    pub fn register(&self, name: &str) -> Subscription {
        self.context.events.register(name)
    }

    pub fn emit(&self, name: &str, event: Event) -> usize {
        self.context.events.emit(name, event)
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.context.events
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn options(&self) -> &Options {
        &self.options
    }
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod manager_test;
