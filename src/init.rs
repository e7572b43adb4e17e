use std::path::PathBuf;

use dialoguer::{Confirm, Input, Password, Select};
use ember_core::config::{Config, RestartMode};

#[derive(Default)]
#[cfg_attr(test, derive(Clone))]
pub(crate) struct WizardState {
    pub(crate) base_url: Option<String>,
    pub(crate) model: Option<String>,
    pub(crate) api_key: Option<String>,
    pub(crate) aux_model: Option<String>,
    pub(crate) data_dir: Option<String>,
    pub(crate) evolution_enabled: bool,
    pub(crate) source_dir: Option<String>,
    pub(crate) restart: RestartMode,
}

pub fn run(output: Option<PathBuf>) -> anyhow::Result<()> {
    println!("ember init - configuration wizard\n");

    let mut state = WizardState {
        evolution_enabled: true,
        ..WizardState::default()
    };

    step_llm(&mut state)?;
    step_memory(&mut state)?;
    step_evolution(&mut state)?;
    step_review_and_write(&state, output)?;

    Ok(())
}

fn step_llm(state: &mut WizardState) -> anyhow::Result<()> {
    println!("== Step 1/3: Model endpoint ==\n");

    state.base_url = Some(
        Input::new()
            .with_prompt("Chat completions base URL")
            .default("http://localhost:8080/v1".into())
            .interact_text()?,
    );
    state.model = Some(
        Input::new()
            .with_prompt("Model name")
            .default("qwen3-8b".into())
            .interact_text()?,
    );
    let raw = Password::new()
        .with_prompt("API key (leave empty for local servers)")
        .allow_empty_password(true)
        .interact()?;
    state.api_key = if raw.is_empty() { None } else { Some(raw) };

    let aux: String = Input::new()
        .with_prompt("Lighter model for summaries and benchmarks (empty to reuse the main one)")
        .default(String::new())
        .allow_empty(true)
        .interact_text()?;
    state.aux_model = Some(aux).filter(|s| !s.trim().is_empty());

    println!();
    Ok(())
}

fn step_memory(state: &mut WizardState) -> anyhow::Result<()> {
    println!("== Step 2/3: Storage ==\n");

    state.data_dir = Some(
        Input::new()
            .with_prompt("Data directory (threads, self-state, playbook)")
            .default("./data".into())
            .interact_text()?,
    );

    println!();
    Ok(())
}

fn step_evolution(state: &mut WizardState) -> anyhow::Result<()> {
    println!("== Step 3/3: Self-evolution ==\n");

    state.evolution_enabled = Confirm::new()
        .with_prompt("Let the agent patch, rebuild and redeploy its own source?")
        .default(true)
        .interact()?;

    if state.evolution_enabled {
        state.source_dir = Some(
            Input::new()
                .with_prompt("Source checkout")
                .default(".".into())
                .interact_text()?,
        );
        let modes = [
            "exec (replace the process in place)",
            "exit (code 75, for supervisors)",
        ];
        let selection = Select::new()
            .with_prompt("Restart after deploy")
            .items(modes)
            .default(0)
            .interact()?;
        state.restart = if selection == 1 {
            RestartMode::Exit
        } else {
            RestartMode::Exec
        };
    }

    println!();
    Ok(())
}

pub(crate) fn build_config(state: &WizardState) -> Config {
    let mut config = Config::default();

    if let Some(url) = &state.base_url {
        config.llm.base_url.clone_from(url);
    }
    if let Some(model) = &state.model {
        config.llm.model.clone_from(model);
    }
    config.llm.api_key.clone_from(&state.api_key);
    config.llm.aux_model.clone_from(&state.aux_model);

    if let Some(dir) = &state.data_dir {
        config.memory.data_dir = PathBuf::from(dir);
    }

    config.evolution.enabled = state.evolution_enabled;
    if let Some(dir) = &state.source_dir {
        config.evolution.source_dir = PathBuf::from(dir);
    }
    config.evolution.restart = state.restart;

    config
}

fn step_review_and_write(state: &WizardState, output: Option<PathBuf>) -> anyhow::Result<()> {
    let config = build_config(state);
    let toml_str = toml::to_string_pretty(&config)?;

    println!("== Review ==\n");
    println!("{toml_str}");

    let path = output.unwrap_or_else(|| PathBuf::from("config/default.toml"));
    if path.exists() {
        let overwrite = Confirm::new()
            .with_prompt(format!("{} exists. Overwrite?", path.display()))
            .default(false)
            .interact()?;
        if !overwrite {
            println!("Aborted.");
            return Ok(());
        }
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, &toml_str)?;
    println!("Config written to {}", path.display());
    if state.api_key.is_some() {
        println!("The API key is stored in plain text; EMBER_LLM_API_KEY can be used instead.");
    }

    Ok(())
}
