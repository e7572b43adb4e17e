mod env;
mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use std::path::Path;

use anyhow::{Context, bail};

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending key.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.llm.model.trim().is_empty() {
            bail!("llm.model must not be empty");
        }
        if self.llm.base_url.trim().is_empty() {
            bail!("llm.base_url must not be empty");
        }
        if self.agent.turn_timeout_secs == 0 {
            bail!("agent.turn_timeout_secs must be greater than zero");
        }
        if self.agent.max_tokens == 0 {
            bail!("agent.max_tokens must be greater than zero");
        }
        if self.tools.max_output_chars == 0 {
            bail!("tools.max_output_chars must be greater than zero");
        }
        if self.compaction.keep_recent == Some(0) {
            bail!("compaction.keep_recent must be greater than zero");
        }
        if self.compaction.forced_keep_recent == 0 {
            bail!("compaction.forced_keep_recent must be greater than zero");
        }
        if self.self_state.max_snapshots < 2 {
            bail!("self_state.max_snapshots must be at least 2");
        }
        if self.playbook.max_bullets == 0 {
            bail!("playbook.max_bullets must be greater than zero");
        }
        Ok(())
    }
}
