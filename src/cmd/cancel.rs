//! Cancel one work item.

use anyhow::Result;

use vigil::config::Config;
use vigil::errors::SessionError;
use vigil::store::StateStore;

pub fn cmd_cancel(config: &Config, id: &str) -> Result<()> {
    let store = StateStore::new(config);
    if store.load_session()?.is_none() {
        return Err(SessionError::NoActiveSession.into());
    }
    let mut item = store.load_work_item(id)?;
    item.cancel_requested = true;
    store.save_work_item(&item)?;
    println!("Cancel requested for {id}; it aborts at the next checkpoint.");
    Ok(())
}
