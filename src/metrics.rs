//! Lifecycle event bus forwarded to an external metrics sink.
//!
//! Subsystems that drop state silently -- a stale registry row, a
//! disconnected subscriber, a dead MCP connection -- emit a
//! [`LifecycleEvent`] through a [`MetricsSink`] instead of only logging.
//! Emission must never block the caller: [`ChannelMetricsSink`] uses
//! `try_send` and drops the event on backpressure rather than stalling
//! the session/registry/health-check loop that produced it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A notable state transition, forwarded to whatever observability system
/// the deployment wires up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    SessionCompleted { session_id: String },
    SessionFailed { session_id: String, reason: String },
    SubscriberDropped { session_id: String },
    ProcessReaped { pid: u32, host: String },
    McpConnectionError { server_id: String },
}

/// Sink for [`LifecycleEvent`]s. Implementations must not block the emitting
/// caller; a full or disconnected downstream should drop the event.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Default sink: discards every event. Used wherever a subsystem is
/// constructed without an explicit sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn emit(&self, _event: LifecycleEvent) {}
}

/// Forwards events onto a bounded channel via `try_send`, dropping the event
/// (and logging at debug level) if the consumer isn't keeping up.
pub struct ChannelMetricsSink {
    tx: mpsc::Sender<LifecycleEvent>,
}

impl ChannelMetricsSink {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Self { tx }), rx)
    }
}

impl MetricsSink for ChannelMetricsSink {
    fn emit(&self, event: LifecycleEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!(error = %e, "lifecycle event dropped, metrics consumer lagging");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_accepts_any_event() {
        let sink = NoopMetricsSink;
        sink.emit(LifecycleEvent::SubscriberDropped { session_id: "s1".into() });
    }

    #[tokio::test]
    async fn channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelMetricsSink::new(4);
        sink.emit(LifecycleEvent::ProcessReaped { pid: 42, host: "h".into() });
        let event = rx.recv().await.unwrap();
        match event {
            LifecycleEvent::ProcessReaped { pid, host } => {
                assert_eq!(pid, 42);
                assert_eq!(host, "h");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn channel_sink_drops_when_full() {
        let (sink, _rx) = ChannelMetricsSink::new(1);
        sink.emit(LifecycleEvent::SessionCompleted { session_id: "a".into() });
        // second emit must not panic or block even though the channel is full
        sink.emit(LifecycleEvent::SessionCompleted { session_id: "b".into() });
    }
}
