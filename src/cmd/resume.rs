//! Unfreeze an escalated work item.

use anyhow::{bail, Result};

use vigil::config::Config;
use vigil::store::StateStore;
use vigil::workitem::Phase;

pub fn cmd_resume(config: &Config, id: &str, phase: Option<&str>) -> Result<()> {
    config.ensure_directories()?;
    let store = StateStore::new(config);
    let mut item = store.load_work_item(id)?;

    if item.phase != Phase::Escalated {
        bail!(
            "Work item {} is not escalated (current phase: {})",
            id,
            item.phase
        );
    }

    let target = phase.map(parse_phase).transpose()?;
    let resumed_to = item.resume(target)?;
    if let Some(record) = item.trail.last() {
        store.append_trail(id, record)?;
    }
    store.save_work_item(&item)?;
    store.clear_escalation(id)?;
    store.enqueue(id)?;

    println!("Resumed {} into {} (attempt counters reset)", id, resumed_to);
    Ok(())
}

fn parse_phase(s: &str) -> Result<Phase> {
    match s.to_lowercase().as_str() {
        "red" => Ok(Phase::Red),
        "green" => Ok(Phase::Green),
        "refactor" => Ok(Phase::Refactor),
        "review" => Ok(Phase::Review),
        other => bail!("'{other}' is not a resumable phase (red, green, refactor, review)"),
    }
}
