pub mod price;
pub mod rate;
pub mod report;
pub mod summary;

use crate::config::Config;
use anyhow::Context;
use std::fs;
use std::path::Path;

/// Load the config file if one was given, otherwise the compiled-in defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading config {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

/// Read the ledger export into memory (delimiter detection needs the full
/// text).
pub fn read_input(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| {
        format!(
            "reading ledger file {} - export \"Generate all statements\" from the \
             exchange's download center",
            path.display()
        )
    })
}
