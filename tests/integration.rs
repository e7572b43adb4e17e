use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ember_core::agent::{Agent, AgentEvent, AgentSettings, TurnRequest, TurnStatus};
use ember_core::config::EvolutionConfig;
use ember_core::evolution::EvolvePipeline;
use ember_core::self_state::SelfStateKernel;
use ember_core::tools::{EvolveTool, SelfStateTool};
use ember_llm::mock::{MockProvider, MockReply};
use ember_llm::{ChatResponse, Message, ToolCall};
use ember_memory::{SUMMARY_PREFIX, ThreadId, ThreadStore};
use ember_tools::{ReadFileTool, SelectorConfig, ToolExecutor, ToolRegistry, Typed};
use tokio::sync::mpsc;

const LIB_RS: &str = "fn one() -> u32 {\n    1\n}\n\nfn two() -> u32 {\n    1 + 1\n}\n";

struct Harness {
    dir: tempfile::TempDir,
    provider: MockProvider,
    aux: MockProvider,
    store: Arc<ThreadStore>,
    kernel: Arc<SelfStateKernel>,
    pipeline: Arc<EvolvePipeline>,
}

impl Harness {
    async fn new(replies: Vec<MockReply>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let source = dir.path().join("checkout");
        std::fs::create_dir_all(source.join("src")).unwrap();
        std::fs::write(source.join("src/lib.rs"), LIB_RS).unwrap();

        let store = Arc::new(ThreadStore::open(&data).await.unwrap());
        let kernel = Arc::new(SelfStateKernel::open(data.join("self"), 20).await.unwrap());
        let evolution = EvolutionConfig {
            source_dir: source,
            binary: Some(dir.path().join("ember-bin")),
            ..EvolutionConfig::default()
        };
        let pipeline = Arc::new(EvolvePipeline::from_config(&evolution, &data).unwrap());

        Self {
            dir,
            provider: MockProvider::with_replies(replies),
            aux: MockProvider::default(),
            store,
            kernel,
            pipeline,
        }
    }

    fn agent(&self) -> Agent<MockProvider> {
        let registry = ToolRegistry::new()
            .with_builtin(Arc::new(Typed(ReadFileTool)))
            .with_builtin(Arc::new(Typed(SelfStateTool::new(
                Arc::clone(&self.kernel),
                self.aux.clone(),
            ))))
            .with_builtin(Arc::new(Typed(EvolveTool::new(Arc::clone(&self.pipeline)))));
        let selector = SelectorConfig {
            core: vec!["read_file".into(), "self_state".into(), "evolve".into()],
            ..SelectorConfig::default()
        };
        let settings = AgentSettings {
            title_generation: false,
            stream: false,
            turn_timeout: Duration::from_secs(5),
            ..AgentSettings::default()
        };
        Agent::new(
            self.provider.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.kernel),
            ToolExecutor::new(Arc::new(registry)),
        )
        .with_aux(self.aux.clone())
        .with_selector(&selector)
        .with_settings(settings)
    }

    fn lib_rs(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("checkout/src/lib.rs")).unwrap()
    }
}

fn reply(text: &str) -> MockReply {
    MockReply::Response(ChatResponse::text(text))
}

fn call(id: &str, name: &str, arguments: &str) -> MockReply {
    MockReply::Response(ChatResponse::with_tool_calls(vec![ToolCall {
        id: id.into(),
        name: name.into(),
        arguments: arguments.into(),
    }]))
}

fn finished(events: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<(String, String, bool)> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let AgentEvent::ToolFinished {
            name,
            output,
            is_error,
            ..
        } = event
        {
            out.push((name, output, is_error));
        }
    }
    out
}

fn snapshot_dir(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<(String, Vec<u8>)> = entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file())
        .map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            (name, std::fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn long_thread_is_compacted_but_log_stays_searchable() {
    let h = Harness::new(vec![reply("the zebra was mentioned early on")]).await;
    let thread = ThreadId::generate();
    let mut seed: Vec<Message> = vec![Message::user("my favourite animal is the zebra")];
    for i in 1..70 {
        seed.push(if i % 2 == 0 {
            Message::user(format!("filler question {i}"))
        } else {
            Message::assistant(format!("filler answer {i}"))
        });
    }
    h.store.append(&thread, &seed).await.unwrap();

    let agent = h.agent();
    let out = agent
        .run_turn(
            TurnRequest::new("which animal did I name first?").in_thread(thread.clone()),
            None,
        )
        .await
        .unwrap();
    assert_eq!(out.status, TurnStatus::Completed);

    let sent = &h.provider.calls()[0].messages;
    assert!(sent.len() < 71);
    assert!(sent[1].content.starts_with(SUMMARY_PREFIX));
    assert!(!sent.iter().any(|m| m.content == "my favourite animal is the zebra"));

    let log = h.store.load(&thread).await.unwrap();
    assert_eq!(log.len(), 72);
    let hits = h.store.search(&thread, "zebra", 10).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits.last().unwrap().index, 0);
}

#[tokio::test]
async fn model_tunes_its_own_params_through_the_tool() {
    let h = Harness::new(vec![
        call(
            "c1",
            "self_state",
            r#"{"action": "set_param", "param": "temperature", "value": 0.2, "reason": "user wants precise answers"}"#,
        ),
        reply("Done, I will be more precise."),
    ])
    .await;
    let agent = h.agent();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let out = agent
        .run_turn(TurnRequest::new("please be less creative"), Some(&tx))
        .await
        .unwrap();
    assert_eq!(out.tool_calls, 1);
    assert_eq!(h.kernel.version().await, 1);
    assert!((h.kernel.params().await.temperature - 0.2).abs() < f32::EPSILON);

    let results = finished(&mut rx);
    assert_eq!(results.len(), 1);
    assert!(!results[0].2);
    assert!(results[0].1.contains("now version 1"));

    let history = h.kernel.history().await.unwrap();
    assert!(history.iter().any(|s| s.version == 0));
}

#[tokio::test]
async fn rejected_prompt_rewrite_leaves_state_untouched() {
    let h = Harness::new(vec![
        call(
            "c1",
            "self_state",
            r#"{"action": "set_prompt", "prompt": "be brief", "reason": "shorter"}"#,
        ),
        reply("That prompt was rejected."),
    ])
    .await;
    let self_dir = h.dir.path().join("data/self");
    let before = h.kernel.current().await;
    let before_files = snapshot_dir(&self_dir);
    let agent = h.agent();
    let (tx, mut rx) = mpsc::unbounded_channel();

    agent
        .run_turn(TurnRequest::new("shorten your prompt"), Some(&tx))
        .await
        .unwrap();

    let results = finished(&mut rx);
    assert!(results[0].2);
    assert_eq!(h.kernel.current().await, before);
    assert_eq!(snapshot_dir(&self_dir), before_files);

    let second_call = &h.provider.calls()[1].messages;
    let tool_msg = second_call.iter().rev().find(|m| m.tool_call_id.is_some()).unwrap();
    assert!(tool_msg.content.contains("prompt"));
}

#[tokio::test]
async fn rollback_to_factory_with_no_snapshots() {
    let h = Harness::new(vec![]).await;
    let factory = h.kernel.current().await;
    h.kernel.set_param("max_turns", "5", "fewer rounds").await.unwrap();
    let _ = std::fs::remove_dir_all(h.dir.path().join("data/self/snapshots"));

    let restored = h.kernel.rollback(0, "undo").await.unwrap();
    assert_eq!(restored.version, 2);
    assert_eq!(restored.params, factory.params);
    assert_eq!(restored.prompt, factory.prompt);
}

#[tokio::test]
async fn ambiguous_patch_leaves_source_unchanged() {
    let h = Harness::new(vec![
        call(
            "c1",
            "evolve",
            r#"{"action": "patch", "file": "src/lib.rs", "old_text": "u32", "new_text": "u64", "description": "widen"}"#,
        ),
        reply("The match was ambiguous, I need more context."),
    ])
    .await;
    let agent = h.agent();
    let (tx, mut rx) = mpsc::unbounded_channel();

    agent
        .run_turn(TurnRequest::new("patch your source to use u64"), Some(&tx))
        .await
        .unwrap();

    let results = finished(&mut rx);
    assert_eq!(results[0].0, "evolve");
    assert!(results[0].2);
    assert!(results[0].1.contains("ambiguous"));
    assert_eq!(h.lib_rs(), LIB_RS);
}

#[tokio::test]
async fn deploy_needs_green_build_and_abort_restores_source() {
    let h = Harness::new(vec![]).await;
    h.pipeline
        .patch(Path::new("src/lib.rs"), "    1\n}", "    100\n}", "bigger one")
        .await
        .unwrap();
    assert_ne!(h.lib_rs(), LIB_RS);

    let err = h.pipeline.deploy("ship it").await.unwrap_err();
    assert!(!err.to_string().is_empty());
    assert!(!h.dir.path().join("ember-bin").exists());

    let restored = h.pipeline.abort().await.unwrap();
    assert_eq!(restored, 1);
    assert_eq!(h.lib_rs(), LIB_RS);
    assert!(h.pipeline.status().await.to_string().contains("phase: none"));
}
