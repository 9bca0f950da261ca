//! Ticket intake command.

use anyhow::{bail, Result};
use std::path::Path;

use vigil::config::Config;
use vigil::errors::IntakeError;
use vigil::policy::{EscalationReason, EscalationRecord};
use vigil::store::StateStore;
use vigil::ticket::Ticket;
use vigil::workitem::Phase;

pub fn cmd_enqueue(config: &Config, ticket_path: &Path) -> Result<()> {
    config.ensure_directories()?;
    let store = StateStore::new(config);

    let ticket = Ticket::load(ticket_path)?;
    match ticket.validate() {
        Ok(()) => {
            if !config.projects.is_empty() && !config.projects.contains_key(&ticket.project) {
                bail!(
                    "Ticket {} names unknown project '{}' (configured: {})",
                    ticket.id,
                    ticket.project,
                    config
                        .projects
                        .keys()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            let item = ticket.into_work_item();
            store.save_work_item(&item)?;
            store.enqueue(&item.id)?;
            println!("Queued {} ({})", item.id, item.title);
            Ok(())
        }
        // An ambiguous ticket is accepted but frozen: a human decides, not
        // the machine.
        Err(IntakeError::Ambiguous { id, message }) => {
            let mut item = ticket.into_work_item();
            item.escalation_reason = Some(EscalationReason::AmbiguousRequirement);
            item.transition(Phase::Escalated, "intake")?;
            if let Some(record) = item.trail.last() {
                store.append_trail(&item.id, record)?;
            }
            store.save_work_item(&item)?;
            store.save_escalation(&EscalationRecord::new(
                id.clone(),
                EscalationReason::AmbiguousRequirement,
                Phase::Queued,
                None,
                vec![message.clone()],
            ))?;
            println!(
                "{} Escalated {} at intake: {}",
                console::style("!").yellow().bold(),
                id,
                message
            );
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
