//! Common test utilities for LabRelay integration tests
#![allow(dead_code)]

use assert_cmd::Command;
use std::path::PathBuf;
use tempfile::{tempdir, TempDir};

/// Isolated HOME with its own `.labrelay` data directory
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub data_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempdir()?;
        let data_dir = temp_dir.path().join(".labrelay");

        Ok(Self { temp_dir, data_dir })
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn plans_file(&self) -> PathBuf {
        self.data_dir.join("plans").join("plans.json")
    }

    /// Command with HOME pointed at the test environment and no inherited overrides
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_labrelay"));
        cmd.env("HOME", self.temp_dir.path());
        cmd.env_remove("LABRELAY_MODEL");
        cmd.env_remove("LABRELAY_API_KEY");
        cmd.env_remove("LABRELAY_API_BASE");
        cmd.env_remove("RUST_LOG");
        cmd
    }

    /// Write a config with one tool server that cannot start
    pub fn create_config(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let config = serde_json::json!({
            "model": {"api_base": "http://127.0.0.1:9/v1"},
            "tool_servers": [
                {
                    "name": "bench",
                    "transport": "subprocess",
                    "command": "/nonexistent/labrelay-test-server"
                }
            ]
        });
        std::fs::write(self.config_file(), serde_json::to_string_pretty(&config)?)?;
        Ok(())
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
