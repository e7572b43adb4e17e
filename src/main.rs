mod cli;
mod init;
mod repl;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use ember_core::agent::{Agent, AgentSettings};
use ember_core::config::Config;
use ember_core::evolution::EvolvePipeline;
use ember_core::self_state::SelfStateKernel;
use ember_core::tools::{EvolveTool, SelfStateTool};
use ember_llm::Role;
use ember_llm::openai::OpenAiProvider;
use ember_memory::{Playbook, PlaybookLimits, ThreadId, ThreadStore};
use ember_tools::{ReadFileTool, ShellTool, ToolExecutor, ToolRegistry, Typed, WriteFileTool};
use tokio::sync::Mutex;

use crate::cli::{Cli, Commands, StateCommands, ThreadCommands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_subscriber();

    let config_path = resolve_config_path(cli.config.as_deref());
    match cli.command {
        Some(Commands::Init { output }) => init::run(Some(output.unwrap_or(config_path))),
        None => {
            let agent = build_agent(&load_config(&config_path)?).await?;
            repl::run(&agent, None).await
        }
        Some(Commands::Chat { thread }) => {
            let thread = thread.as_deref().map(parse_thread).transpose()?;
            let agent = build_agent(&load_config(&config_path)?).await?;
            repl::run(&agent, thread).await
        }
        Some(Commands::Ask { message, thread }) => {
            let thread = thread.as_deref().map(parse_thread).transpose()?;
            let agent = build_agent(&load_config(&config_path)?).await?;
            repl::ask(&agent, thread, message).await
        }
        Some(Commands::Threads(cmd)) => threads(&load_config(&config_path)?, cmd).await,
        Some(Commands::State(cmd)) => state(&load_config(&config_path)?, cmd).await,
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = Config::load(path)?;
    config.validate()?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

fn init_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("EMBER_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("config/default.toml")
}

fn parse_thread(id: &str) -> anyhow::Result<ThreadId> {
    id.parse().with_context(|| format!("invalid thread id: {id}"))
}

fn create_providers(config: &Config) -> (OpenAiProvider, OpenAiProvider) {
    let provider = OpenAiProvider::new(
        config.llm.base_url.clone(),
        config.llm.model.clone(),
        config.llm.api_key.clone(),
    )
    .with_streaming(config.llm.stream);
    let aux = provider.with_model(config.llm.aux_model()).with_streaming(false);
    tracing::info!(
        model = provider.model(),
        aux_model = aux.model(),
        base_url = %config.llm.base_url,
        "model endpoint configured"
    );
    (provider, aux)
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<ThreadStore>> {
    let store = ThreadStore::open(&config.memory.data_dir)
        .await
        .with_context(|| format!("failed to open {}", config.memory.data_dir.display()))?;
    Ok(Arc::new(store))
}

async fn open_kernel(config: &Config) -> anyhow::Result<Arc<SelfStateKernel>> {
    let dir = config.memory.data_dir.join("self");
    let kernel = SelfStateKernel::open(dir, config.self_state.max_snapshots)
        .await
        .context("failed to load self-state")?;
    Ok(Arc::new(kernel))
}

async fn build_agent(config: &Config) -> anyhow::Result<Agent<OpenAiProvider>> {
    let (provider, aux) = create_providers(config);
    let store = open_store(config).await?;
    let kernel = open_kernel(config).await?;

    let mut registry = ToolRegistry::new()
        .with_builtin(Arc::new(Typed(ShellTool::new(&config.tools.shell))))
        .with_builtin(Arc::new(Typed(ReadFileTool)))
        .with_builtin(Arc::new(Typed(WriteFileTool)))
        .with_builtin(Arc::new(Typed(SelfStateTool::new(
            Arc::clone(&kernel),
            aux.clone(),
        ))));
    if config.evolution.enabled {
        let pipeline = EvolvePipeline::from_config(&config.evolution, &config.memory.data_dir)
            .context("failed to set up the evolution pipeline")?;
        tracing::info!(source = %config.evolution.source_dir.display(), "self-evolution enabled");
        registry = registry.with_builtin(Arc::new(Typed(EvolveTool::new(Arc::new(pipeline)))));
    }
    let executor =
        ToolExecutor::new(Arc::new(registry)).with_max_output_chars(config.tools.max_output_chars);

    let mut agent = Agent::new(provider, store, kernel, executor)
        .with_aux(aux)
        .with_selector(&config.tools.selector)
        .with_compaction(config.compaction.clone())
        .with_settings(AgentSettings::from_config(config));

    if config.playbook.enabled {
        let limits = PlaybookLimits {
            max_bullets: config.playbook.max_bullets,
            miss_floor: config.playbook.miss_floor,
        };
        let book = Playbook::load(&config.memory.data_dir.join("playbook.json"), limits)
            .await
            .context("failed to load playbook")?;
        tracing::info!(bullets = book.len(), "playbook loaded");
        agent = agent.with_playbook(Arc::new(Mutex::new(book)));
    }

    Ok(agent)
}

async fn threads(config: &Config, cmd: ThreadCommands) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    match cmd {
        ThreadCommands::List => {
            let all = store.list().await?;
            if all.is_empty() {
                println!("no threads");
            }
            for meta in all {
                println!(
                    "{}  {}  {:>4} msgs  {}",
                    meta.id,
                    meta.updated_at.format("%Y-%m-%d %H:%M"),
                    meta.message_count,
                    meta.title
                );
            }
        }
        ThreadCommands::Show { id } => {
            let id = parse_thread(&id)?;
            let meta = store.meta(&id).await?;
            println!("# {}\n", meta.title);
            for message in store.load(&id).await? {
                print_message(&message);
            }
        }
        ThreadCommands::Search { id, query, limit } => {
            let id = parse_thread(&id)?;
            let hits = store.search(&id, &query, limit).await?;
            if hits.is_empty() {
                println!("no matches");
            }
            for hit in hits {
                println!(
                    "#{} [{}] {}",
                    hit.index,
                    hit.message.role,
                    repl::preview(&hit.message.content, 120)
                );
            }
        }
        ThreadCommands::Delete { id, yes } => {
            let id = parse_thread(&id)?;
            let confirmed = yes
                || dialoguer::Confirm::new()
                    .with_prompt(format!("Delete thread {id}?"))
                    .default(false)
                    .interact()?;
            if confirmed {
                store.delete(&id).await?;
                println!("deleted {id}");
            }
        }
    }
    Ok(())
}

async fn state(config: &Config, cmd: StateCommands) -> anyhow::Result<()> {
    let kernel = open_kernel(config).await?;
    match cmd {
        StateCommands::Show => {
            let s = kernel.current().await;
            println!("version {}", s.version);
            if let Some(score) = s.benchmark_score {
                println!("benchmark {score:.2}");
            }
            println!("{}", toml::to_string_pretty(&s.params)?);
            for rule in &s.rules {
                let flag = if rule.active { " " } else { "x" };
                println!("[{flag}] {} {}  ({})", rule.id, rule.text, rule.reason);
            }
            println!("\n{}", s.prompt);
        }
        StateCommands::History => {
            for meta in kernel.history().await? {
                let score = meta.score.map(|s| format!(" score {s:.2}")).unwrap_or_default();
                println!(
                    "v{:<4} {}  {}{score}",
                    meta.version,
                    meta.taken_at.format("%Y-%m-%d %H:%M:%S"),
                    meta.reason
                );
            }
            println!("current v{}", kernel.version().await);
        }
        StateCommands::Rollback { version, reason } => {
            let restored = kernel.rollback(version, &reason).await?;
            println!("restored v{version} as v{}", restored.version);
        }
        StateCommands::Benchmark => {
            let (_, aux) = create_providers(config);
            let report = kernel.benchmark(&aux).await?;
            println!("v{} on {}: {:.2}", report.version, report.model, report.overall);
            for (category, score) in &report.categories {
                println!("  {:<16} {score:.2}", category.as_str());
            }
            if report.overall <= 0.0 {
                bail!("every probe failed; is the model endpoint reachable?");
            }
        }
    }
    Ok(())
}

fn print_message(message: &ember_llm::Message) {
    match message.role {
        Role::Tool => println!(
            "  <- {}: {}",
            message.tool_call_id.as_deref().unwrap_or("?"),
            repl::preview(&message.content, 120)
        ),
        role => {
            if !message.content.is_empty() {
                println!("{role}: {}", message.content);
            }
            for call in &message.tool_calls {
                println!("  -> {} {}", call.name, call.arguments);
            }
        }
    }
}
