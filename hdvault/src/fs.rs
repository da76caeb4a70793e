use anyhow::{Context, Result};
use directories_next::ProjectDirs;
use std::path::{Path, PathBuf};

/// Linux: /home/<user>/.config/hdvault/
/// OSX: /Users/<user>/Library/Preferences/hdvault/
pub fn system_config_dir() -> Result<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Linux: /home/<user>/.local/share/hdvault/
/// OSX: /Users/<user>/Library/Application Support/hdvault/
pub fn system_data_dir() -> Result<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

pub fn default_config_path() -> Result<PathBuf> {
    system_config_dir().map(|dir| dir.join("config.toml"))
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "hdvault").context("Could not determine the home directory of the current user")
}

pub fn ensure_directory_exists(file: &Path) -> Result<(), std::io::Error> {
    if let Some(path) = file.parent() {
        if !path.exists() {
            tracing::info!(
                directory = %path.display(),
                "Parent directory does not exist, creating recursively",
            );
            return std::fs::create_dir_all(path);
        }
    }
    Ok(())
}
