//! Layered config loader: defaults → user config → project config → local
//! override → `MERIDIAN_` environment variables.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::paths::Paths;
use crate::MeridianConfig;

/// Builder for [`MeridianConfig`], mirroring the reference project's
/// `ConfigLoader` precedence order.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "MERIDIAN".to_string(),
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Loads and validates the configuration.
    pub fn load(self) -> Result<MeridianConfig> {
        let mut builder = config::Config::builder();

        let defaults = MeridianConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        let paths = Paths::new();
        if let Ok(user_config_file) = paths.user_config_file() {
            if user_config_file.exists() {
                builder = builder.add_source(
                    config::File::from(user_config_file)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(
                config::File::from(project_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(
                config::File::from(local_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let built = builder.build()?;
        let config: MeridianConfig = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration, falling back to defaults on any error
    /// (used by examples/demos that don't want to fail on a missing file).
    pub fn load_or_default(self) -> MeridianConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn loads_built_in_defaults_with_no_files_present() {
        let temp_dir = tempdir().unwrap();
        let err = ConfigLoader::new().with_project_dir(temp_dir.path()).load().unwrap_err();
        // kv.bucket has no default and is required; absent project file means
        // validation fails rather than silently defaulting to an empty bucket.
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn project_file_overrides_defaults() {
        let temp_dir = tempdir().unwrap();
        let project_dir = temp_dir.path();
        fs::write(
            project_dir.join("meridian.toml"),
            r#"
[kv]
bucket = "meridian-kv"

[bus]
pool_size = 3
"#,
        )
        .unwrap();

        let config = ConfigLoader::new().with_project_dir(project_dir).load().unwrap();
        assert_eq!(config.kv.bucket, "meridian-kv");
        assert_eq!(config.bus.pool_size, 3);
    }

    #[test]
    fn local_file_overrides_project_file() {
        let temp_dir = tempdir().unwrap();
        let project_dir = temp_dir.path();
        fs::write(
            project_dir.join("meridian.toml"),
            "[kv]\nbucket = \"project-bucket\"\n",
        )
        .unwrap();
        fs::write(
            project_dir.join("meridian.local.toml"),
            "[kv]\nbucket = \"local-bucket\"\n",
        )
        .unwrap();

        let config = ConfigLoader::new().with_project_dir(project_dir).load().unwrap();
        assert_eq!(config.kv.bucket, "local-bucket");
    }
}
