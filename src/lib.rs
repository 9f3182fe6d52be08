//! Migrates legacy extension tables into new layouts during an upgrade.
//!
//! [`migrate::Engine`] holds the table-to-table operations, [`updater`] the host loop
//! that checks prerequisites and runs an [`updater::Updater`] until it completes, and
//! [`plan`] an updater driven by a JSON plan file.

pub mod config;
pub mod db;
pub mod error;
pub mod files;
pub mod logging;
pub mod migrate;
pub mod plan;
pub mod updater;

pub use error::{AppError, AppResult};

use std::path::PathBuf;

/// Database used when no `--db` is given: `<data dir>/extupdate/extupdate.sqlite3`.
pub fn default_db_path() -> anyhow::Result<PathBuf> {
    let base = match dirs::data_dir() {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    Ok(base.join("extupdate").join("extupdate.sqlite3"))
}
