//! Ticket intake.
//!
//! A ticket is the operator-facing input document. Intake is the only place
//! the orchestrator reads requirement prose; everything after validation
//! works from the derived WorkItem. Ambiguous tickets never reach RED: they
//! are rejected here so the caller can escalate immediately instead of
//! letting the machine guess.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::IntakeError;
use crate::workitem::{AttemptCounters, Phase, WorkItem};

/// Markers that make a requirement unactionable without a human decision.
const AMBIGUITY_MARKERS: &[&str] = &["TBD", "TODO(?)", "???", "to be decided", "not sure"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub requirement_text: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Key into the configured project table.
    #[serde(default)]
    pub project: String,
}

impl Ticket {
    /// Load a ticket from a JSON file.
    pub fn load(path: &Path) -> Result<Self, IntakeError> {
        let content = std::fs::read_to_string(path).map_err(|source| IntakeError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(IntakeError::ParseFailed)
    }

    /// Structural validation. Missing required fields are malformed input;
    /// present-but-unactionable requirements are ambiguous.
    pub fn validate(&self) -> Result<(), IntakeError> {
        for (field, value) in [
            ("id", &self.id),
            ("title", &self.title),
            ("requirement_text", &self.requirement_text),
            ("project", &self.project),
        ] {
            if value.trim().is_empty() {
                return Err(IntakeError::MissingField { field });
            }
        }
        if let Some(message) = self.ambiguity() {
            return Err(IntakeError::Ambiguous {
                id: self.id.clone(),
                message,
            });
        }
        Ok(())
    }

    /// Why this ticket cannot be driven unattended, if it cannot.
    fn ambiguity(&self) -> Option<String> {
        if self.acceptance_criteria.is_empty() {
            return Some("no acceptance criteria; cannot derive a failing-test target".into());
        }
        if let Some(blank_idx) = self
            .acceptance_criteria
            .iter()
            .position(|c| c.trim().is_empty())
        {
            return Some(format!("acceptance criterion {} is blank", blank_idx + 1));
        }
        for text in std::iter::once(&self.requirement_text).chain(&self.acceptance_criteria) {
            for marker in AMBIGUITY_MARKERS {
                if text.contains(marker) {
                    return Some(format!("contains unresolved marker {marker:?}: {text}"));
                }
            }
        }
        None
    }

    /// Build the queued WorkItem for a validated ticket. Callers run
    /// [`Ticket::validate`] first; this does not re-check.
    pub fn into_work_item(self) -> WorkItem {
        let now = Utc::now();
        WorkItem {
            id: self.id,
            title: self.title,
            requirement_text: self.requirement_text,
            acceptance_criteria: self.acceptance_criteria,
            constraints: self.constraints,
            project: self.project,
            phase: Phase::Queued,
            attempts: AttemptCounters::default(),
            escalation_reason: None,
            escalated_from: None,
            green_snapshot: None,
            red_test_names: Vec::new(),
            applied: BTreeMap::new(),
            trail: Vec::new(),
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }
}
