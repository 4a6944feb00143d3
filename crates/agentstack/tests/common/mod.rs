use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A working directory with its own settings file
pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let project = Self {
            root: tempfile::tempdir().unwrap(),
        };
        project.write_settings("project_name = \"demo\"\nregion = \"us-west-2\"\n");
        project
    }

    pub fn write_settings(&self, content: &str) {
        fs::write(self.settings_path(), content).unwrap();
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.path().join("agentstack.toml")
    }

    #[allow(dead_code)]
    pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[allow(dead_code)]
    pub fn config_json(&self) -> serde_json::Value {
        let text = fs::read_to_string(self.path().join("application").join("config.json")).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// The binary, run inside the project with no inherited agentstack variables
    pub fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("agentstack").unwrap();
        cmd.current_dir(self.path())
            .env_remove("AGENTSTACK_PROJECT")
            .env_remove("AGENTSTACK_REGION")
            .env_remove("AGENTSTACK_PROJECT_NAME")
            .env_remove("RUST_LOG")
            .env("AGENTSTACK_CONFIG_PATH", self.settings_path())
            .env("NO_COLOR", "1");
        cmd
    }
}
