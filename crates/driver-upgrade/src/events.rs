//! Events published on [`Node`](k8s_openapi::api::core::v1::Node) objects while they are
//! upgraded.

use kube::runtime::events::{Event, EventType};

use crate::state::UpgradeState;

/// Kubernetes rejects event notes longer than this.
const MAX_NOTE_LEN: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeEventType {
    Normal,
    Warning,
}

/// An event about a node, independent of how it is delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEvent {
    pub type_: NodeEventType,
    pub reason: String,
    pub note: String,
}

impl NodeEvent {
    pub fn normal(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            type_: NodeEventType::Normal,
            reason: reason.into(),
            note: note.into(),
        }
    }

    pub fn warning(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            type_: NodeEventType::Warning,
            reason: reason.into(),
            note: note.into(),
        }
    }

    pub fn state_changed(driver_name: &str, state: UpgradeState) -> Self {
        Self::normal(
            format!("{driver_name}DriverUpgrade"),
            format!("Successfully updated node state label to [{state}]"),
        )
    }

    /// Converts into a publishable [`Event`], shortening overly long notes.
    pub fn into_kube_event(self, action: &str) -> Event {
        Event {
            type_: match self.type_ {
                NodeEventType::Normal => EventType::Normal,
                NodeEventType::Warning => EventType::Warning,
            },
            reason: self.reason,
            note: Some(shorten_note(self.note)),
            action: action.to_owned(),
            secondary: None,
        }
    }
}

/// Cuts `note` down to [`MAX_NOTE_LEN`] bytes at a char boundary and marks the cut.
fn shorten_note(note: String) -> String {
    const MARKER: &str = " (truncated)";

    if note.len() <= MAX_NOTE_LEN {
        return note;
    }
    let keep = MAX_NOTE_LEN - MARKER.len();
    let end = note
        .char_indices()
        .map(|(index, _)| index)
        .take_while(|index| *index <= keep)
        .last()
        .unwrap_or_default();
    format!("{}{MARKER}", &note[..end])
}
