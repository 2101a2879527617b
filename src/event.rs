//! Observability events a component may emit to an optional sink, so a host
//! can observe progress without the pipeline owning a message-passing
//! runtime of its own.

/// A progress/completion/error notification from somewhere in the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PacketIndexed { id: usize, timestamp_ns: u64 },
    SnapshotSaved { count: usize },
    ReadCompleted { timestamp_ns: u64, bytes: usize },
    ParseWarning { reason: String },
}

/// The sender half used by components to notify an interested observer.
///
/// A full channel drops the event rather than blocking the hot path that
/// produced it: the sink is an observability aid, not a delivery guarantee.
pub type EventSink = tokio::sync::mpsc::Sender<Event>;

pub(crate) fn emit(sink: Option<&EventSink>, event: Event) {
    if let Some(sink) = sink {
        let _ = sink.try_send(event);
    }
}
