//! Recording sinks shared by the step tests.

use crate::{EventSink, StatusSink, StepId, StepMeta};
use envop_core::StepState;
use std::sync::Mutex;

/// Records every sink call for assertions.
#[derive(Default)]
pub struct RecordingSinks {
    pub infos: Mutex<Vec<String>>,
    pub warnings: Mutex<Vec<String>>,
    pub updates: Mutex<Vec<(StepState, String)>>,
}

impl RecordingSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn infos(&self) -> Vec<String> {
        self.infos.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<(StepState, String)> {
        self.updates.lock().unwrap().clone()
    }

    /// Assert the update sequence starts Running and ends with exactly one
    /// terminal state equal to `want`.
    pub fn assert_transitions(&self, want: StepState) {
        let updates = self.updates();
        assert!(!updates.is_empty(), "no updates recorded");
        assert_eq!(updates[0].0, StepState::Running, "first update must be Running");
        let terminal: Vec<_> = updates
            .iter()
            .filter(|(s, _)| matches!(s, StepState::Ready | StepState::Error))
            .collect();
        assert_eq!(terminal.len(), 1, "expected exactly one terminal update: {updates:?}");
        assert_eq!(updates.last().unwrap().0, want);
    }
}

impl EventSink for RecordingSinks {
    fn info(&self, _id: &StepId, text: &str) {
        self.infos.lock().unwrap().push(text.to_string());
    }

    fn warning(&self, _id: &StepId, text: &str) {
        self.warnings.lock().unwrap().push(text.to_string());
    }
}

impl StatusSink for RecordingSinks {
    fn update(&self, meta: &StepMeta) {
        self.updates.lock().unwrap().push((meta.state, meta.msg.clone()));
    }
}
