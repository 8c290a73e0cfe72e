//! Tests for event sinks

use extraction_scheduler::core::{
    build_event, EventKind, EventSink, InMemoryEventSink, SchedulerEvent, TracingEventSink,
};

#[test]
fn test_in_memory_event_sink() {
    let sink = InMemoryEventSink::new(10);

    sink.record(build_event(
        "scheduler:listings",
        EventKind::Iteration,
        Some("{\"pending\":3}".to_string()),
    ));

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source, "scheduler:listings");
    assert_eq!(events[0].kind, EventKind::Iteration);
    assert_eq!(events[0].detail.as_deref(), Some("{\"pending\":3}"));
}

#[test]
fn test_event_sink_overflow() {
    let sink = InMemoryEventSink::new(2);

    sink.record(build_event("a", EventKind::TaskStarted, None));
    sink.record(build_event("b", EventKind::TaskStarted, None));
    sink.record(build_event("c", EventKind::TaskCompleted, None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].source, "b"); // oldest dropped
    assert_eq!(events[1].source, "c");
}

#[test]
fn test_zero_capacity_sink_records_nothing() {
    let sink = InMemoryEventSink::new(0);
    sink.record(build_event("a", EventKind::TaskFaulted, None));
    assert!(sink.events().is_empty());
}

#[test]
fn test_events_of_filters_by_kind() {
    let sink = InMemoryEventSink::new(8);
    sink.record(build_event("t1", EventKind::TaskStarted, None));
    sink.record(build_event("t1", EventKind::TaskFaulted, Some("boom".into())));
    sink.record(build_event("t2", EventKind::TaskStarted, None));

    assert_eq!(sink.events_of(EventKind::TaskStarted).len(), 2);
    let faulted = sink.events_of(EventKind::TaskFaulted);
    assert_eq!(faulted.len(), 1);
    assert_eq!(faulted[0].source, "t1");
    assert!(sink.events_of(EventKind::ChunkAborted).is_empty());
}

#[test]
fn test_event_serializes_kind_in_snake_case() {
    let event = build_event("chunk #1", EventKind::ChunkAborted, None);
    let json = serde_json::to_string(&event).unwrap();
    assert!(json.contains("\"kind\":\"chunk_aborted\""));

    let back: SchedulerEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(back.kind, EventKind::ChunkAborted);
    assert_eq!(back.event_id, event.event_id);
}

#[test]
fn test_tracing_sink_accepts_every_kind() {
    let sink = TracingEventSink;
    for kind in [
        EventKind::OperationFaulted,
        EventKind::Iteration,
        EventKind::ChunkAborted,
        EventKind::TaskStarted,
        EventKind::TaskCompleted,
        EventKind::TaskFaulted,
        EventKind::TaskExited,
    ] {
        sink.record(build_event("tracing", kind, None));
    }
}
