use std::path::PathBuf;

use super::Config;

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_llm();
        self.apply_env_overrides_runtime();
    }

    fn apply_env_overrides_llm(&mut self) {
        if let Ok(v) = std::env::var("EMBER_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("EMBER_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("EMBER_LLM_API_KEY") {
            self.llm.api_key = Some(v).filter(|k| !k.is_empty());
        }
        if let Ok(v) = std::env::var("EMBER_LLM_AUX_MODEL") {
            self.llm.aux_model = Some(v).filter(|m| !m.is_empty());
        }
        if let Ok(v) = std::env::var("EMBER_LLM_STREAM") {
            if let Ok(stream) = v.parse::<bool>() {
                self.llm.stream = stream;
            } else {
                tracing::warn!("ignoring invalid EMBER_LLM_STREAM value: {v}");
            }
        }
    }

    fn apply_env_overrides_runtime(&mut self) {
        if let Ok(v) = std::env::var("EMBER_DATA_DIR") {
            self.memory.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("EMBER_TURN_TIMEOUT") {
            if let Ok(secs) = v.parse::<u64>() {
                self.agent.turn_timeout_secs = secs;
            } else {
                tracing::warn!("ignoring invalid EMBER_TURN_TIMEOUT value: {v}");
            }
        }
        if let Ok(v) = std::env::var("EMBER_COMPACTION_KEEP_RECENT") {
            if let Ok(keep) = v.parse::<usize>() {
                self.compaction.keep_recent = Some(keep);
            } else {
                tracing::warn!("ignoring invalid EMBER_COMPACTION_KEEP_RECENT value: {v}");
            }
        }
        if let Ok(v) = std::env::var("EMBER_COMPACTION_LONG_THREAD") {
            if let Ok(count) = v.parse::<usize>() {
                self.compaction.long_thread_messages = count;
            } else {
                tracing::warn!("ignoring invalid EMBER_COMPACTION_LONG_THREAD value: {v}");
            }
        }
        if let Ok(v) = std::env::var("EMBER_TOOLS_MAX_OUTPUT") {
            if let Ok(chars) = v.parse::<usize>() {
                self.tools.max_output_chars = chars;
            } else {
                tracing::warn!("ignoring invalid EMBER_TOOLS_MAX_OUTPUT value: {v}");
            }
        }
        if let Ok(v) = std::env::var("EMBER_EVOLUTION_SOURCE_DIR") {
            self.evolution.source_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("EMBER_EVOLUTION_BINARY") {
            self.evolution.binary = Some(PathBuf::from(v)).filter(|p| !p.as_os_str().is_empty());
        }
        if let Ok(v) = std::env::var("EMBER_PLAYBOOK_ENABLED")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.playbook.enabled = enabled;
        }
    }
}
