//! A storage plugin that records what it is given.

use std::sync::{Arc, Mutex};

use ipacct_config::GroupId;
use ipacct_core::event::{AccountRecord, Event, LossRecord};
use ipacct_core::plugin::{Plugin, PluginError, PluginRegistry};

/// Shared view of everything a [`RecordingPlugin`] received.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recording {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("recording lock poisoned").clone()
    }

    /// Event kinds in arrival order, e.g. `["start_write", "account", ...]`.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::kind).collect()
    }

    fn push(&self, event: Event) {
        self.events
            .lock()
            .expect("recording lock poisoned")
            .push(event);
    }
}

/// Records every call as the matching [`Event`]; optionally fails on one
/// kind of call.
pub struct RecordingPlugin {
    recording: Recording,
    fail_on: Option<&'static str>,
}

impl RecordingPlugin {
    pub fn new() -> (Self, Recording) {
        let recording = Recording::default();
        let plugin = Self {
            recording: recording.clone(),
            fail_on: None,
        };
        (plugin, recording)
    }

    /// Fail when handling an event of kind `kind` (see [`Event::kind`]).
    pub fn failing_on(kind: &'static str) -> (Self, Recording) {
        let (mut plugin, recording) = Self::new();
        plugin.fail_on = Some(kind);
        (plugin, recording)
    }

    /// Register as `"recording"` in `registry`; every instance the registry
    /// creates shares the returned recording.
    pub fn register(registry: &mut PluginRegistry) -> Recording {
        let recording = Recording::default();
        let shared = recording.clone();
        registry.register("recording", "records events for tests", move |_| {
            Ok(Box::new(RecordingPlugin {
                recording: shared.clone(),
                fail_on: None,
            }))
        });
        recording
    }

    fn record(&mut self, event: Event) -> Result<(), PluginError> {
        let kind = event.kind();
        self.recording.push(event);
        if self.fail_on == Some(kind) {
            return Err(PluginError::Backend(format!("refusing {kind}")));
        }
        Ok(())
    }
}

impl Plugin for RecordingPlugin {
    fn name(&self) -> &str {
        "recording"
    }

    fn start_write(&mut self) -> Result<(), PluginError> {
        self.record(Event::StartWrite)
    }

    fn account(&mut self, record: &AccountRecord) -> Result<(), PluginError> {
        self.record(Event::Account(record.clone()))
    }

    fn loss(&mut self, record: &LossRecord) -> Result<(), PluginError> {
        self.record(Event::Loss(record.clone()))
    }

    fn end_write(&mut self) -> Result<(), PluginError> {
        self.record(Event::EndWrite)
    }

    fn terminate(&mut self) -> Result<(), PluginError> {
        self.record(Event::Terminate)
    }
}

/// One accounting record reduced to what tests compare.
pub type Accounted = (GroupId, Vec<u8>, u64);

/// Split an event stream into rounds of accounting records.
///
/// Panics unless every round is framed by exactly one `StartWrite` and one
/// `EndWrite` with only records in between. Records are sorted within each
/// round, since counters answer in no particular order. A trailing
/// `Terminate` is allowed.
pub fn split_rounds(events: &[Event]) -> Vec<Vec<Accounted>> {
    let mut rounds = Vec::new();
    let mut current: Option<Vec<Accounted>> = None;
    for (i, event) in events.iter().enumerate() {
        match event {
            Event::StartWrite => {
                assert!(current.is_none(), "nested StartWrite at {i}: {events:?}");
                current = Some(Vec::new());
            }
            Event::Account(record) => {
                let round = current
                    .as_mut()
                    .unwrap_or_else(|| panic!("record outside a round at {i}: {events:?}"));
                round.push((record.group, record.address.as_bytes().to_vec(), record.value));
            }
            Event::Loss(_) => {
                assert!(current.is_some(), "loss outside a round at {i}: {events:?}");
            }
            Event::EndWrite => {
                let mut round = current
                    .take()
                    .unwrap_or_else(|| panic!("EndWrite without a round at {i}: {events:?}"));
                round.sort();
                rounds.push(round);
            }
            Event::Terminate => {
                assert!(current.is_none(), "Terminate inside a round: {events:?}");
                assert_eq!(i + 1, events.len(), "events after Terminate: {events:?}");
            }
        }
    }
    assert!(current.is_none(), "unfinished round: {events:?}");
    rounds
}
