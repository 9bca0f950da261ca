//! Pause the active attention window at its next safe checkpoint.

use anyhow::Result;

use vigil::config::Config;
use vigil::errors::SessionError;
use vigil::store::StateStore;

pub fn cmd_pause(config: &Config) -> Result<()> {
    let store = StateStore::new(config);
    let Some(mut session) = store.load_session()? else {
        return Err(SessionError::NoActiveSession.into());
    };
    session.pause_requested = true;
    store.save_session(&session)?;
    println!("Pause requested; in-flight items stop at their next checkpoint.");
    Ok(())
}
