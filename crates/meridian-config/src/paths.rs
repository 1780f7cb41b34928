//! XDG-compliant path discovery for the layered config loader.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::error::ConfigError;

/// Resolves the user config directory and the well-known project-local
/// config file names.
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("io", "Meridian", "meridian"),
        }
    }

    /// `~/.config/meridian/` (platform-appropriate equivalent).
    pub fn user_config_dir(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|p| p.config_dir().to_path_buf())
            .ok_or_else(|| ConfigError::Xdg("failed to determine user config directory".to_string()))
    }

    /// `~/.config/meridian/config.toml`.
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.user_config_dir()?.join("config.toml"))
    }

    /// `<project_dir>/meridian.toml`.
    pub fn project_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("meridian.toml")
    }

    /// `<project_dir>/meridian.local.toml`, meant to be gitignored.
    pub fn local_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("meridian.local.toml")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn project_paths_are_relative_to_the_given_dir() {
        let temp_dir = tempdir().unwrap();
        let project_dir = temp_dir.path();
        assert_eq!(Paths::project_config_file(project_dir), project_dir.join("meridian.toml"));
        assert_eq!(
            Paths::local_config_file(project_dir),
            project_dir.join("meridian.local.toml")
        );
    }
}
