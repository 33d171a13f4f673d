//! Writer loop against a recording plugin.

use std::time::{Duration, SystemTime};

use ipacct_core::event::{AccountRecord, Event, LossRecord};
use ipacct_core::queue::event_queue;
use ipacct_core::writer::{Writer, WriterError, WriterSettings, WriterStats};
use ipacct_test_utils::plugin::RecordingPlugin;
use ipacct_test_utils::tracing_setup::LogCapture;
use pretty_assertions::assert_eq;
use tracing::Level;

fn account(group: u16, value: u64, timestamp: SystemTime) -> Event {
    Event::Account(AccountRecord {
        timestamp,
        group,
        address: [192u8, 0, 2, 1][..].into(),
        value,
    })
}

fn round(timestamp: SystemTime) -> Vec<Event> {
    vec![
        Event::StartWrite,
        account(1, 10, timestamp),
        Event::Loss(LossRecord {
            timestamp,
            group: 1,
            count: 3,
        }),
        account(2, 20, timestamp),
        Event::EndWrite,
    ]
}

#[test_log::test]
fn test_events_reach_plugin_in_queue_order() {
    let (tx, rx) = event_queue();
    let (plugin, recording) = RecordingPlugin::new();
    let now = SystemTime::now();
    let mut sent = round(now);
    sent.extend(round(now));
    sent.push(Event::Terminate);
    for event in sent.clone() {
        tx.send(event).unwrap();
    }

    let stats = Writer::new(Box::new(plugin), rx, WriterSettings::default())
        .run()
        .unwrap();

    assert_eq!(recording.events(), sent);
    assert_eq!(
        stats,
        WriterStats {
            rounds: 2,
            records: 4,
            losses: 2,
        }
    );
}

#[test_log::test]
fn test_events_after_terminate_are_not_consumed() {
    let (tx, rx) = event_queue();
    let (plugin, recording) = RecordingPlugin::new();
    tx.send(Event::Terminate).unwrap();
    tx.send(Event::StartWrite).unwrap();

    Writer::new(Box::new(plugin), rx, WriterSettings::default())
        .run()
        .unwrap();

    assert_eq!(recording.kinds(), vec!["terminate"]);
}

#[test_log::test]
fn test_plugin_failure_stops_the_writer() {
    let (tx, rx) = event_queue();
    let (plugin, recording) = RecordingPlugin::failing_on("end_write");
    for event in round(SystemTime::now()) {
        tx.send(event).unwrap();
    }
    tx.send(Event::Terminate).unwrap();

    let err = Writer::new(Box::new(plugin), rx, WriterSettings::default())
        .run()
        .unwrap_err();

    let WriterError::Plugin { plugin, event, .. } = &err;
    assert_eq!(plugin, "recording");
    assert_eq!(*event, "end_write");
    assert_eq!(recording.kinds().last(), Some(&"end_write"));
    assert!(!recording.kinds().contains(&"terminate"));
}

#[test_log::test]
fn test_closed_queue_ends_the_writer() {
    let (tx, rx) = event_queue();
    let (plugin, recording) = RecordingPlugin::new();
    tx.send(Event::StartWrite).unwrap();
    drop(tx);

    let stats = Writer::new(Box::new(plugin), rx, WriterSettings::default())
        .run()
        .unwrap();

    assert_eq!(stats.rounds, 0);
    assert_eq!(recording.kinds(), vec!["start_write"]);
}

#[test]
fn test_backlog_and_lag_warnings() {
    let (logs, _guard) = LogCapture::install();
    let (tx, rx) = event_queue();
    let (plugin, _recording) = RecordingPlugin::new();
    let stale = SystemTime::now() - Duration::from_secs(600);
    for event in round(stale) {
        tx.send(event).unwrap();
    }
    tx.send(Event::Terminate).unwrap();

    let settings = WriterSettings {
        queue_size_warn: 2,
        queue_age_warn: Duration::from_secs(60),
    };
    Writer::new(Box::new(plugin), rx, settings).run().unwrap();

    assert_eq!(logs.find(Level::WARN, "backing up").len(), 1);
    // Three stale records, one warning for the round.
    assert_eq!(logs.find(Level::WARN, "lagging").len(), 1);
}

#[test_log::test]
fn test_spawned_writer_returns_stats() {
    let (tx, rx) = event_queue();
    let (plugin, _recording) = RecordingPlugin::new();
    let handle = Writer::new(Box::new(plugin), rx, WriterSettings::default())
        .spawn()
        .unwrap();

    for event in round(SystemTime::now()) {
        tx.send(event).unwrap();
    }
    tx.send(Event::Terminate).unwrap();

    let stats = handle.join().unwrap();
    assert_eq!(stats.rounds, 1);
    assert_eq!(stats.records, 2);
}
