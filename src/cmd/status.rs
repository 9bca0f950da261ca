//! Session, queue, and item overview.

use anyhow::Result;

use vigil::config::Config;
use vigil::store::StateStore;
use vigil::workitem::Phase;

pub fn cmd_status(config: &Config) -> Result<()> {
    let store = StateStore::new(config);

    println!();
    println!("vigil status");
    println!("============");
    println!();

    match store.load_session()? {
        Some(session) => {
            let state = if session.pause_requested {
                console::style("pausing").yellow().to_string()
            } else {
                console::style("active").green().to_string()
            };
            println!(
                "Session: {} (started {}, budget {}m)",
                state,
                session.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                session.budget_secs / 60
            );
        }
        None => println!("Session: none"),
    }

    let queue = store.load_queue()?;
    println!("Queued:  {}", queue.len());
    println!();

    let items = store.list_work_items()?;
    if items.is_empty() {
        println!("No work items.");
        println!();
        return Ok(());
    }

    println!(
        "{:<12} {:<10} {:<10} {:<9} Title",
        "Item", "Phase", "Project", "Attempts"
    );
    println!(
        "{:<12} {:<10} {:<10} {:<9} -----",
        "------------", "----------", "----------", "--------"
    );
    for item in &items {
        let attempts = item.attempts.get(item.phase);
        let phase = match item.phase {
            Phase::Done => console::style(item.phase.to_string()).green().to_string(),
            Phase::Escalated => console::style(item.phase.to_string()).yellow().to_string(),
            Phase::Aborted => console::style(item.phase.to_string()).red().to_string(),
            _ => item.phase.to_string(),
        };
        println!(
            "{:<12} {:<10} {:<10} {:<9} {}",
            item.id, phase, item.project, attempts, item.title
        );
    }
    println!();

    let escalated: Vec<_> = items
        .iter()
        .filter(|i| i.phase == Phase::Escalated)
        .collect();
    if !escalated.is_empty() {
        println!("Escalations awaiting a human:");
        for item in escalated {
            let reason = item
                .escalation_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".into());
            println!(
                "  {} {} ({})",
                console::style("!").yellow().bold(),
                item.id,
                reason
            );
            if let Some(record) = store.load_escalation(&item.id)? {
                for line in record.recent_signals.iter().rev().take(3) {
                    println!("      {}", console::style(line).dim());
                }
            }
        }
        println!();
    }
    Ok(())
}
