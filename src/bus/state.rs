//! # Activity introspection snapshots.
//!
//! The bus reports per-dispatcher queue depth and in-flight count, grouped
//! by endpoint. Snapshots drive
//! [`MessageBus::wait_for_not_active`](crate::bus::MessageBus::wait_for_not_active)
//! and its timeout diagnostic.

use std::sync::Arc;

use crate::bus::id::EndpointId;

/// Point-in-time counters of one dispatcher.
#[derive(Clone, Debug)]
pub struct DispatcherState {
    /// Dispatcher name as shown in reports.
    pub dispatcher: Arc<str>,
    /// Messages currently being handled.
    pub active_count: usize,
    /// Messages waiting in the dispatcher queue.
    pub queue_count: usize,
}

impl DispatcherState {
    /// True when the dispatcher has queued or in-flight work.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.active_count > 0 || self.queue_count > 0
    }
}

/// Counters of every dispatcher registered on one endpoint.
#[derive(Clone, Debug)]
pub struct EndpointState {
    /// The endpoint the dispatchers are registered on.
    pub endpoint: EndpointId,
    /// One entry per distinct dispatcher.
    pub dispatchers: Vec<DispatcherState>,
}

impl EndpointState {
    /// True when any dispatcher on the endpoint is busy.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.dispatchers.iter().any(DispatcherState::is_busy)
    }
}

/// Snapshot of all inspected endpoints.
#[derive(Clone, Debug, Default)]
pub struct ActivityReport {
    /// Endpoint states in topology definition order.
    pub endpoints: Vec<EndpointState>,
}

impl ActivityReport {
    /// True when any endpoint in the snapshot is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.endpoints.iter().any(EndpointState::is_active)
    }

    /// Renders the busy endpoints for the activity timeout diagnostic.
    ///
    /// Lists every endpoint that still has busy dispatchers, one indented
    /// line per dispatcher with its queue and active counters. Idle
    /// endpoints are omitted.
    #[must_use]
    pub fn busy_report(&self) -> String {
        let mut lines = Vec::new();
        for endpoint_state in &self.endpoints {
            let busy: Vec<&DispatcherState> = endpoint_state
                .dispatchers
                .iter()
                .filter(|state| state.is_busy())
                .collect();
            if busy.is_empty() {
                continue;
            }
            lines.push(format!("  {}:", endpoint_state.endpoint.name()));
            for state in busy {
                lines.push(format!(
                    "    {}: queue_count={}, active_count={}",
                    state.dispatcher, state.queue_count, state.active_count
                ));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(dispatcher: &str, active: usize, queued: usize) -> DispatcherState {
        DispatcherState {
            dispatcher: dispatcher.into(),
            active_count: active,
            queue_count: queued,
        }
    }

    #[test]
    fn test_busy_detection() {
        assert!(!state("idle", 0, 0).is_busy());
        assert!(state("working", 1, 0).is_busy());
        assert!(state("backlogged", 0, 3).is_busy());
    }

    #[test]
    fn test_busy_report_lists_only_busy_dispatchers() {
        let report = ActivityReport {
            endpoints: vec![
                EndpointState {
                    endpoint: EndpointId::new("sut", "sut"),
                    dispatchers: vec![state("idle", 0, 0), state("slow", 1, 2)],
                },
                EndpointState {
                    endpoint: EndpointId::new("logger", "logger"),
                    dispatchers: vec![state("drained", 0, 0)],
                },
            ],
        };

        assert!(report.is_active());
        assert_eq!(
            report.busy_report(),
            "  sut:\n    slow: queue_count=2, active_count=1"
        );
    }

    #[test]
    fn test_idle_report_is_empty() {
        let report = ActivityReport {
            endpoints: vec![EndpointState {
                endpoint: EndpointId::new("sut", "sut"),
                dispatchers: vec![state("idle", 0, 0)],
            }],
        };
        assert!(!report.is_active());
        assert_eq!(report.busy_report(), "");
    }
}
