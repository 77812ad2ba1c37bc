use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use super::{Component, ComponentBuilder, Context, Manager};
use crate::{
    config::Options,
    events::{Event, METADATA},
    garbage::Collector,
};

type Journal = Arc<Mutex<Vec<String>>>;

struct Recorder {
    name: String,
    journal: Journal,
    fail_start: bool,
    fail_close: bool,
}

impl Component for Recorder {
    fn start(&self) -> anyhow::Result<()> {
        self.journal.lock().push(format!("start {}", self.name));
        if self.fail_start {
            anyhow::bail!("{} refused to start", self.name);
        }
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        self.journal.lock().push(format!("close {}", self.name));
        if self.fail_close {
            anyhow::bail!("{} refused to close", self.name);
        }
        Ok(())
    }
}

struct RecorderBuilder {
    name: &'static str,
    journal: Journal,
    fail_start: bool,
    fail_close: bool,
}

impl RecorderBuilder {
    fn boxed(name: &'static str, journal: &Journal) -> Box<Self> {
        Box::new(Self {
            name,
            journal: Arc::clone(journal),
            fail_start: false,
            fail_close: false,
        })
    }
}

impl ComponentBuilder for RecorderBuilder {
    fn defaults(&self) -> Options {
        let mut defaults = Options::new();
        defaults.insert(format!("{}.volume", self.name), json!(5));
        defaults.insert("shared".to_string(), json!("default"));
        defaults
    }

    fn build(
        self: Box<Self>,
        _context: &Context,
        previous: Option<Arc<dyn Component>>,
        options: &Options,
    ) -> anyhow::Result<Arc<dyn Component>> {
        self.journal.lock().push(format!(
            "build {} after {} volume {} shared {}",
            self.name,
            previous.is_some(),
            options[&format!("{}.volume", self.name)],
            options["shared"],
        ));
        Ok(Arc::new(Recorder {
            name: self.name.to_string(),
            journal: self.journal,
            fail_start: self.fail_start,
            fail_close: self.fail_close,
        }))
    }
}

fn options() -> Options {
    let mut options = Options::new();
    options.insert("shared".to_string(), json!("manager"));
    options
}

#[test]
fn test_manager_builds_in_order_with_merged_options() {
    let journal = Journal::default();

    let _manager = Manager::with_collector(
        None,
        vec![
            RecorderBuilder::boxed("first", &journal),
            RecorderBuilder::boxed("second", &journal),
        ],
        options(),
        Collector::new(std::time::Duration::from_secs(1)),
    )
    .unwrap();

    assert_eq!(
        *journal.lock(),
        vec![
            "build first after false volume 5 shared \"manager\"",
            "build second after true volume 5 shared \"manager\"",
        ]
    );
}

#[test]
fn test_manager_start_is_idempotent() {
    let journal = Journal::default();
    let manager = Manager::new(
        None,
        vec![
            RecorderBuilder::boxed("first", &journal),
            RecorderBuilder::boxed("second", &journal),
        ],
        Options::new(),
    )
    .unwrap();
    journal.lock().clear();

    manager.start().unwrap();
    manager.start().unwrap();
    assert!(manager.is_started());
    assert_eq!(*journal.lock(), vec!["start first", "start second"]);

    manager.close().unwrap();
    assert!(!manager.is_started());
    assert_eq!(
        *journal.lock(),
        vec!["start first", "start second", "close first", "close second"]
    );
}

#[test]
fn test_manager_close_closes_events() {
    let manager = Manager::new(None, Vec::new(), Options::new()).unwrap();
    let subscription = manager.register(METADATA);

    assert_eq!(manager.emit(METADATA, Event::Metadata("song".into())), 1);
    manager.close().unwrap();

    assert!(manager.events().is_closed());
    assert!(subscription.recv().is_ok());
    assert!(subscription.recv().is_err());
}

#[test]
fn test_manager_propagates_lifecycle_errors() {
    let journal = Journal::default();
    let mut broken = RecorderBuilder::boxed("broken", &journal);
    broken.fail_start = true;
    broken.fail_close = true;

    let manager = Manager::new(
        None,
        vec![broken, RecorderBuilder::boxed("after", &journal)],
        Options::new(),
    )
    .unwrap();

    let err = manager.start().unwrap_err();
    assert_eq!(err.to_string(), "broken refused to start");
    assert!(!manager.is_started());

    let err = manager.close().unwrap_err();
    assert_eq!(err.to_string(), "broken refused to close");
}

#[test]
fn test_manager_propagates_build_errors() {
    let failing = |_: &Context,
                   _: Option<Arc<dyn Component>>,
                   _: &Options|
     -> anyhow::Result<Arc<dyn Component>> { anyhow::bail!("no output configured") };

    let err = Manager::new(None, vec![Box::new(failing)], Options::new())
        .err()
        .unwrap();
    assert_eq!(err.to_string(), "no output configured");
}

#[test]
fn test_closure_builders_share_the_context() {
    let seen: Arc<Mutex<Option<Context>>> = Arc::default();
    let slot = Arc::clone(&seen);
    let builder = move |context: &Context,
                        _: Option<Arc<dyn Component>>,
                        _: &Options|
          -> anyhow::Result<Arc<dyn Component>> {
        *slot.lock() = Some(context.clone());
        Ok(Arc::new(Recorder {
            name: "closure".to_string(),
            journal: Journal::default(),
            fail_start: false,
            fail_close: false,
        }))
    };

    let manager = Manager::new(None, vec![Box::new(builder)], Options::new()).unwrap();

    let context = seen.lock().take().unwrap();
    assert!(Arc::ptr_eq(&context.events, manager.events()));
    assert!(context.collector.same_as(&Collector::global()));
    assert!(context.source.is_none());
}
