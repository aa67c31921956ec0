use std::{io, path::PathBuf};

use anyhow::{anyhow, Result};

pub const APPLICATION_NAME: &str = "tacks";

/// Directory for state that isn't worth syncing, e.g. logs. Usually `$XDG_STATE_HOME/tacks` or
/// `$HOME/.local/state/tacks`.
pub fn create_application_default_path() -> Result<PathBuf> {
    let mut path = dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .ok_or_else(|| anyhow!("Couldn't find neither a state nor a local data directory"))?;
    path.push(APPLICATION_NAME);

    match std::fs::create_dir_all(&path) {
        Ok(_) => Ok(path),
        Err(v) if v.kind() == io::ErrorKind::AlreadyExists => Ok(path),
        Err(v) => Err(v.into()),
    }
}

/// `$HOME/.config/tacks/config.toml`, on every platform.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| {
        home.join(".config")
            .join(APPLICATION_NAME)
            .join("config.toml")
    })
}
