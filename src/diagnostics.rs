use std::fmt;
use std::sync::Mutex;

/// Connection lifecycle transitions reported to a [`DiagnosticsSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    Opened,
    Closed,
    TransactionBegun,
    Committed,
    RolledBack,
    NestedCreated,
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleKind::Opened => "open",
            LifecycleKind::Closed => "close",
            LifecycleKind::TransactionBegun => "begin",
            LifecycleKind::Committed => "commit",
            LifecycleKind::RolledBack => "rollback",
            LifecycleKind::NestedCreated => "nested",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    /// Connection string of the connection the event happened on.
    pub connection: String,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.connection)
    }
}

/// Side channel for connection lifecycle traces.
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, event: &LifecycleEvent);
}

/// Forwards lifecycle events to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn record(&self, event: &LifecycleEvent) {
        tracing::debug!(event = %event.kind, connection = %event.connection, "connection lifecycle");
    }
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Events of one kind, as `"<kind> <connection>"` lines.
    #[must_use]
    pub fn lines(&self, kind: LifecycleKind) -> Vec<String> {
        self.events()
            .iter()
            .filter(|e| e.kind == kind)
            .map(ToString::to_string)
            .collect()
    }
}

impl DiagnosticsSink for RecordingSink {
    fn record(&self, event: &LifecycleEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        for kind in [LifecycleKind::Opened, LifecycleKind::Committed, LifecycleKind::Closed] {
            sink.record(&LifecycleEvent {
                kind,
                connection: "main.db".into(),
            });
        }
        let kinds: Vec<_> = sink.events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![LifecycleKind::Opened, LifecycleKind::Committed, LifecycleKind::Closed]
        );
        assert_eq!(sink.lines(LifecycleKind::Committed), vec!["commit main.db"]);
    }
}
