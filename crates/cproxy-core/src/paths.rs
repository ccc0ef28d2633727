use std::path::PathBuf;

use home::home_dir;

/// Per-user configuration directory holding auth.json, config.json, and
/// apikey.json. Falls back to the working directory when no home directory
/// can be resolved.
pub fn config_dir() -> PathBuf {
    let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".cproxy");
    path
}
