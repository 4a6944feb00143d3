//! agentstack settings
//!
//! Layers, lowest first: built-in defaults, the settings file, `AGENTSTACK_*`
//! environment variables, command-line overrides.

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Environment variable pointing directly at a settings file
pub const CONFIG_PATH_ENV: &str = "AGENTSTACK_CONFIG_PATH";

const ENV_PREFIX: &str = "AGENTSTACK";

const CANDIDATES: [&str; 3] = ["agentstack.local.toml", "agentstack.toml", ".agentstack.toml"];

/// Resolved settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub project_name: String,
    pub region: String,
    /// Repository name, the project name when unset
    #[serde(default)]
    pub git_name: Option<String>,
    pub repository_owner: String,
    /// Application config written on the instance, relative to the checkout
    pub config_path: String,
    pub instance_type: String,
    pub volume_size_gb: u32,
    pub app_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_name: "woo-project".to_string(),
            region: "us-west-2".to_string(),
            git_name: None,
            repository_owner: "kyopark2014".to_string(),
            config_path: "application/config.json".to_string(),
            instance_type: "t3.medium".to_string(),
            volume_size_gb: 80,
            app_port: 8501,
        }
    }
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub project_name: Option<String>,
    pub region: Option<String>,
}

impl Settings {
    pub fn git_name(&self) -> &str {
        self.git_name.as_deref().unwrap_or(&self.project_name)
    }

    /// Load with every layer; `explicit_path` replaces the file search
    pub fn load(explicit_path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let file = match explicit_path {
            Some(path) if path.exists() => Some(path.to_path_buf()),
            Some(path) => return Err(ConfigError::SettingsFileNotFound(path.to_path_buf())),
            None => find_settings_file()?,
        };
        Self::layered(file.as_deref(), environment(std::env::vars()), overrides)
    }

    fn layered(
        file: Option<&Path>,
        env: HashMap<String, String>,
        overrides: &Overrides,
    ) -> Result<Self> {
        let defaults = Settings::default();
        let mut builder = config::Config::builder()
            .set_default("project_name", defaults.project_name)?
            .set_default("region", defaults.region)?
            .set_default("repository_owner", defaults.repository_owner)?
            .set_default("config_path", defaults.config_path)?
            .set_default("instance_type", defaults.instance_type)?
            .set_default("volume_size_gb", i64::from(defaults.volume_size_gb))?
            .set_default("app_port", i64::from(defaults.app_port))?;

        if let Some(path) = file {
            tracing::debug!("Loading settings from {}", path.display());
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .source(Some(env)),
        );

        if let Some(project) = &overrides.project_name {
            builder = builder.set_override("project_name", project.as_str())?;
        }
        if let Some(region) = &overrides.region {
            builder = builder.set_override("region", region.as_str())?;
        }

        Ok(builder.build()?.try_deserialize()?)
    }
}

/// `AGENTSTACK_*` variables, minus the settings-file pointer
fn environment(vars: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
    let prefix = format!("{}_", ENV_PREFIX);
    vars.filter(|(key, _)| key.starts_with(&prefix) && key != CONFIG_PATH_ENV)
        .collect()
}

/// `~/.config/agentstack`
pub fn get_config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("agentstack"))
}

/// Locate the settings file
///
/// Search order:
/// 1. `AGENTSTACK_CONFIG_PATH` (must exist when set)
/// 2. current directory: agentstack.local.toml, agentstack.toml, .agentstack.toml
/// 3. `./.agentstack/`, same order
/// 4. `~/.config/agentstack/agentstack.toml`
///
/// `Ok(None)` means no file; defaults and environment still apply.
pub fn find_settings_file() -> Result<Option<PathBuf>> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(Some(path));
        }
        return Err(ConfigError::SettingsFileNotFound(path));
    }

    let current_dir = std::env::current_dir()?;
    for dir in [current_dir.clone(), current_dir.join(".agentstack")] {
        if !dir.is_dir() {
            continue;
        }
        if let Some(path) = CANDIDATES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
        {
            return Ok(Some(path));
        }
    }

    if let Ok(config_dir) = get_config_dir() {
        let global = config_dir.join("agentstack.toml");
        if global.exists() {
            return Ok(Some(global));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        environment(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::layered(None, HashMap::new(), &Overrides::default()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.git_name(), "woo-project");
    }

    #[test]
    fn test_layer_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("agentstack.toml");
        fs::write(
            &file,
            "project_name = \"from-file\"\nregion = \"eu-west-1\"\ninstance_type = \"t3.large\"\n",
        )
        .unwrap();

        let settings = Settings::layered(
            Some(&file),
            env(&[("AGENTSTACK_REGION", "ap-northeast-2"), ("AGENTSTACK_APP_PORT", "8080")]),
            &Overrides {
                project_name: Some("from-cli".into()),
                region: None,
            },
        )
        .unwrap();

        assert_eq!(settings.project_name, "from-cli");
        assert_eq!(settings.region, "ap-northeast-2");
        assert_eq!(settings.instance_type, "t3.large");
        assert_eq!(settings.app_port, 8080);
        assert_eq!(settings.volume_size_gb, 80);
    }

    #[test]
    fn test_git_name_defaults_to_project() {
        let settings = Settings::layered(
            None,
            env(&[("AGENTSTACK_PROJECT_NAME", "demo"), ("AGENTSTACK_GIT_NAME", "demo-app")]),
            &Overrides::default(),
        )
        .unwrap();
        assert_eq!(settings.git_name(), "demo-app");

        let settings = Settings::layered(
            None,
            env(&[("AGENTSTACK_PROJECT_NAME", "demo")]),
            &Overrides::default(),
        )
        .unwrap();
        assert_eq!(settings.git_name(), "demo");
    }

    #[test]
    fn test_environment_skips_config_path_and_foreign_vars() {
        let vars = env(&[
            ("AGENTSTACK_CONFIG_PATH", "/tmp/x.toml"),
            ("AGENTSTACK_REGION", "us-east-1"),
            ("HOME", "/root"),
        ]);
        assert_eq!(vars.len(), 1);
        assert!(vars.contains_key("AGENTSTACK_REGION"));
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let missing = Path::new("/nonexistent/agentstack.toml");
        let err = Settings::load(Some(missing), &Overrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::SettingsFileNotFound(_)));
    }

    #[test]
    #[serial]
    fn test_find_settings_file_local_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        fs::write(temp_dir.path().join("agentstack.toml"), "").unwrap();
        fs::write(temp_dir.path().join("agentstack.local.toml"), "").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = temp_env::with_var_unset(CONFIG_PATH_ENV, find_settings_file);

        std::env::set_current_dir(original_dir).unwrap();
        assert!(result.unwrap().unwrap().ends_with("agentstack.local.toml"));
    }

    #[test]
    #[serial]
    fn test_find_settings_file_in_dot_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        let dot_dir = temp_dir.path().join(".agentstack");
        fs::create_dir(&dot_dir).unwrap();
        fs::write(dot_dir.join(".agentstack.toml"), "").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = temp_env::with_var_unset(CONFIG_PATH_ENV, find_settings_file);

        std::env::set_current_dir(original_dir).unwrap();
        assert!(result.unwrap().unwrap().ends_with(".agentstack/.agentstack.toml"));
    }

    #[test]
    #[serial]
    fn test_find_settings_file_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.toml");
        fs::write(&config_path, "").unwrap();

        let result = temp_env::with_var(CONFIG_PATH_ENV, Some(&config_path), find_settings_file);
        assert_eq!(result.unwrap(), Some(config_path));

        let missing = temp_dir.path().join("missing.toml");
        let result = temp_env::with_var(CONFIG_PATH_ENV, Some(&missing), find_settings_file);
        assert!(matches!(result, Err(ConfigError::SettingsFileNotFound(p)) if p == missing));
    }
}
