pub mod inspect;
pub mod run;

// Re-export command functions for convenience
pub use inspect::{fail_counters, stats};
pub use run::{once, run, worker};

use anyhow::{Context, Result};
use std::sync::Arc;

use feedcycle::config::Config;
use feedcycle::storage::{DataStore, SqliteStore};

fn open_store(config: &Config) -> Result<Arc<dyn DataStore>> {
    let store = SqliteStore::new(&config.database.sqlite_path).with_context(|| {
        format!(
            "Failed to open database: {}",
            config.database.sqlite_path.display()
        )
    })?;
    Ok(Arc::new(store))
}
