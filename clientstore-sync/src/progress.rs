use tokio::sync::mpsc;

/// One progress update for a UI sink: `current` of `total` (when known),
/// with a short label such as the file being processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub current: u64,
    pub total: Option<u64>,
    pub label: String,
}

/// Receives progress from a running batch. Implementations must be cheap
/// and must not block; UI code marshals events onto its own thread.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn report(&self, event: ProgressEvent) {
        // Receiver gone means nobody is watching any more.
        let _ = self.send(event);
    }
}

pub(crate) fn report(
    sink: Option<&dyn ProgressSink>,
    current: u64,
    total: Option<u64>,
    label: impl Into<String>,
) {
    if let Some(sink) = sink {
        sink.report(ProgressEvent {
            current,
            total,
            label: label.into(),
        });
    }
}
