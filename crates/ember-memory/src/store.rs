//! Append-only per-thread message logs.
//!
//! Layout under `<data_dir>/threads/`:
//! - `<id>.jsonl`: one [`LogRecord`] per line, never rewritten
//! - `<id>.meta.json`: the mutable [`ThreadMeta`]
//!
//! Lines written by the previous log format (bare messages without a `v` field) are
//! upgraded when read.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ember_llm::{Attachment, Message, Role, ToolCall};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::MemoryError;
use crate::jsonl;
use crate::types::{DEFAULT_TITLE, ThreadId, ThreadMeta, derive_title};

/// Marks a compaction summary. Such messages are skipped by keyword search.
pub const SUMMARY_PREFIX: &str = "[Conversation summary]";

const LOG_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    v: u32,
    ts: DateTime<Utc>,
    message: Message,
}

#[derive(Debug, Deserialize)]
struct LegacyRecord {
    role: Role,
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    tool_calls: Vec<LegacyToolCall>,
    #[serde(default)]
    tool_call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyToolCall {
    #[serde(default)]
    id: String,
    function: LegacyFunction,
}

#[derive(Debug, Deserialize)]
struct LegacyFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

impl From<LegacyRecord> for Message {
    fn from(old: LegacyRecord) -> Self {
        let tool_calls = old
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(i, tc)| ToolCall {
                id: if tc.id.is_empty() {
                    format!("call_{i}")
                } else {
                    tc.id
                },
                name: tc.function.name,
                arguments: match tc.function.arguments {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                },
            })
            .collect();
        Message {
            role: old.role,
            content: old.content,
            reasoning: old.thinking.filter(|t| !t.is_empty()),
            attachments: old.images.iter().map(|i| parse_image(i)).collect(),
            tool_calls,
            tool_call_id: old.tool_call_id,
        }
    }
}

fn parse_image(raw: &str) -> Attachment {
    if let Some(rest) = raw.strip_prefix("data:")
        && let Some((mime, data)) = rest.split_once(";base64,")
    {
        return Attachment {
            mime_type: mime.to_owned(),
            data: data.to_owned(),
        };
    }
    Attachment {
        mime_type: "image/png".to_owned(),
        data: raw.to_owned(),
    }
}

fn decode_line(line: &str) -> Result<Message, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    if value.get("v").is_some() {
        serde_json::from_value::<LogRecord>(value).map(|r| r.message)
    } else {
        serde_json::from_value::<LegacyRecord>(value).map(Message::from)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Position of the message in the full log.
    pub index: usize,
    pub message: Message,
}

#[derive(Debug)]
pub struct ThreadStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl ThreadStore {
    /// Open (and create if needed) the store rooted at `<data_dir>/threads`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(data_dir: &Path) -> Result<Self, MemoryError> {
        let root = data_dir.join("threads");
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn log_path(&self, id: &ThreadId) -> PathBuf {
        self.root.join(format!("{id}.jsonl"))
    }

    fn meta_path(&self, id: &ThreadId) -> PathBuf {
        self.root.join(format!("{id}.meta.json"))
    }

    pub async fn exists(&self, id: &ThreadId) -> bool {
        tokio::fs::try_exists(self.meta_path(id)).await.unwrap_or(false)
            || tokio::fs::try_exists(self.log_path(id)).await.unwrap_or(false)
    }

    /// Create an empty thread with the given title.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be written.
    pub async fn create(&self, id: &ThreadId, title: &str) -> Result<ThreadMeta, MemoryError> {
        let _guard = self.write_lock.lock().await;
        let meta = ThreadMeta::new(id.clone(), title.to_owned());
        self.write_meta(&meta).await?;
        tracing::debug!(thread = %id, "thread created");
        Ok(meta)
    }

    /// Append messages to the log and update metadata. A thread seen for the first
    /// time is created, titled after its first user message.
    ///
    /// # Errors
    ///
    /// Returns an error if the log or metadata cannot be written.
    pub async fn append(
        &self,
        id: &ThreadId,
        messages: &[Message],
    ) -> Result<ThreadMeta, MemoryError> {
        let _guard = self.write_lock.lock().await;
        let mut meta = match self.read_meta(id).await? {
            Some(m) => m,
            None => {
                let title = messages
                    .iter()
                    .find(|m| m.role == Role::User)
                    .map_or_else(|| DEFAULT_TITLE.to_owned(), |m| derive_title(&m.content));
                ThreadMeta::new(id.clone(), title)
            }
        };
        let now = Utc::now();
        for message in messages {
            jsonl::append(
                &self.log_path(id),
                &LogRecord {
                    v: LOG_VERSION,
                    ts: now,
                    message: message.clone(),
                },
            )
            .await?;
        }
        meta.message_count += messages.len();
        meta.updated_at = now;
        self.write_meta(&meta).await?;
        Ok(meta)
    }

    /// Full message log in order.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown thread, or an I/O error.
    pub async fn load(&self, id: &ThreadId) -> Result<Vec<Message>, MemoryError> {
        let text = match tokio::fs::read_to_string(self.log_path(id)).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return if self.exists(id).await {
                    Ok(Vec::new())
                } else {
                    Err(MemoryError::NotFound(id.to_string()))
                };
            }
            Err(e) => return Err(e.into()),
        };
        Ok(text
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .filter_map(|(i, line)| match decode_line(line) {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::warn!(thread = %id, line = i + 1, "skipping malformed log line: {e}");
                    None
                }
            })
            .collect())
    }

    /// Thread metadata, rebuilt from the log if the metadata file is missing.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown thread.
    pub async fn meta(&self, id: &ThreadId) -> Result<ThreadMeta, MemoryError> {
        if let Some(meta) = self.read_meta(id).await? {
            return Ok(meta);
        }
        let messages = self.load(id).await?;
        let title = messages
            .iter()
            .find(|m| m.role == Role::User)
            .map_or_else(|| DEFAULT_TITLE.to_owned(), |m| derive_title(&m.content));
        let mut meta = ThreadMeta::new(id.clone(), title);
        meta.message_count = messages.len();
        Ok(meta)
    }

    /// All threads, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn list(&self) -> Result<Vec<ThreadMeta>, MemoryError> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".meta.json")) else {
                continue;
            };
            let Ok(id) = stem.parse::<ThreadId>() else {
                continue;
            };
            match self.read_meta(&id).await {
                Ok(Some(meta)) => out.push(meta),
                Ok(None) => {}
                Err(e) => tracing::warn!(thread = %id, "unreadable thread metadata: {e}"),
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown thread.
    pub async fn set_title(&self, id: &ThreadId, title: &str) -> Result<ThreadMeta, MemoryError> {
        let _guard = self.write_lock.lock().await;
        let mut meta = self
            .read_meta(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        title.trim().clone_into(&mut meta.title);
        self.write_meta(&meta).await?;
        Ok(meta)
    }

    /// Remove the log and metadata together.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if neither file existed.
    pub async fn delete(&self, id: &ThreadId) -> Result<(), MemoryError> {
        let _guard = self.write_lock.lock().await;
        let mut removed = false;
        for path in [self.log_path(id), self.meta_path(id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if removed {
            tracing::info!(thread = %id, "thread deleted");
            Ok(())
        } else {
            Err(MemoryError::NotFound(id.to_string()))
        }
    }

    /// Case-insensitive keyword search over the full on-disk log. Every whitespace
    /// separated term must appear. Compaction summaries are excluded. Newest hits first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown thread.
    pub async fn search(
        &self,
        id: &ThreadId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let messages = self.load(id).await?;
        Ok(messages
            .into_iter()
            .enumerate()
            .rev()
            .filter(|(_, m)| !m.content.starts_with(SUMMARY_PREFIX))
            .filter(|(_, m)| {
                let haystack = m.content.to_lowercase();
                terms.iter().all(|t| haystack.contains(t.as_str()))
            })
            .take(limit)
            .map(|(index, message)| SearchHit { index, message })
            .collect())
    }

    async fn read_meta(&self, id: &ThreadId) -> Result<Option<ThreadMeta>, MemoryError> {
        match tokio::fs::read(self.meta_path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_meta(&self, meta: &ThreadMeta) -> Result<(), MemoryError> {
        let bytes = serde_json::to_vec_pretty(meta)?;
        jsonl::write_atomic(&self.meta_path(&meta.id), &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    async fn store() -> (tempfile::TempDir, ThreadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ThreadStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn append_creates_thread_with_title() {
        let (_dir, store) = store().await;
        let id = ThreadId::generate();
        let meta = store
            .append(&id, &[Message::user("how do I rotate logs"), Message::assistant("use logrotate")])
            .await
            .unwrap();
        assert_eq!(meta.title, "how do I rotate logs");
        assert_eq!(meta.message_count, 2);
        assert!(store.exists(&id).await);

        let msgs = store.load(&id).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].content, "use logrotate");
    }

    #[tokio::test]
    async fn append_updates_count_and_timestamp() {
        let (_dir, store) = store().await;
        let id = ThreadId::generate();
        let first = store.append(&id, &[Message::user("a")]).await.unwrap();
        let second = store.append(&id, &[Message::assistant("b")]).await.unwrap();
        assert_eq!(second.message_count, 2);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn load_unknown_thread_is_not_found() {
        let (_dir, store) = store().await;
        let err = store.load(&ThreadId::generate()).await.unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn created_thread_loads_empty() {
        let (_dir, store) = store().await;
        let id = ThreadId::generate();
        store.create(&id, "blank").await.unwrap();
        assert!(store.load(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn legacy_lines_are_migrated() {
        let (dir, store) = store().await;
        let id: ThreadId = "legacy".parse().unwrap();
        let legacy = concat!(
            r#"{"role":"user","content":"show files","images":["data:image/jpeg;base64,QUJD"]}"#,
            "\n",
            r#"{"role":"assistant","content":"","thinking":"list dir","tool_calls":[{"id":"t1","function":{"name":"shell","arguments":{"command":"ls"}}}]}"#,
            "\n",
            "not json at all\n",
            r#"{"role":"tool","content":"a.txt","tool_call_id":"t1"}"#,
            "\n",
        );
        tokio::fs::write(dir.path().join("threads/legacy.jsonl"), legacy)
            .await
            .unwrap();

        let msgs = store.load(&id).await.unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].attachments[0].mime_type, "image/jpeg");
        assert_eq!(msgs[0].attachments[0].data, "QUJD");
        assert_eq!(msgs[1].reasoning.as_deref(), Some("list dir"));
        assert_eq!(msgs[1].tool_calls[0].name, "shell");
        assert_eq!(msgs[1].tool_calls[0].arguments, r#"{"command":"ls"}"#);
        assert_eq!(msgs[2].tool_call_id.as_deref(), Some("t1"));

        // metadata is rebuilt from the log
        let meta = store.meta(&id).await.unwrap();
        assert_eq!(meta.message_count, 3);
        assert_eq!(meta.title, "show files");
    }

    #[tokio::test]
    async fn appends_after_legacy_lines_mix_cleanly() {
        let (dir, store) = store().await;
        let id: ThreadId = "mixed".parse().unwrap();
        let path = dir.path().join("threads/mixed.jsonl");
        tokio::fs::write(&path, "{\"role\":\"user\",\"content\":\"old\"}\n")
            .await
            .unwrap();
        store.append(&id, &[Message::assistant("new")]).await.unwrap();
        let msgs = store.load(&id).await.unwrap();
        assert_eq!(
            msgs.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            ["old", "new"]
        );
    }

    #[tokio::test]
    async fn list_orders_by_recent_update() {
        let (_dir, store) = store().await;
        let a: ThreadId = "a".parse().unwrap();
        let b: ThreadId = "b".parse().unwrap();
        store.append(&a, &[Message::user("first")]).await.unwrap();
        store.append(&b, &[Message::user("second")]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.append(&a, &[Message::user("again")]).await.unwrap();

        let list = store.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, a);
    }

    #[tokio::test]
    async fn set_title_and_delete() {
        let (_dir, store) = store().await;
        let id = ThreadId::generate();
        store.append(&id, &[Message::user("x")]).await.unwrap();
        let meta = store.set_title(&id, "  Renamed ").await.unwrap();
        assert_eq!(meta.title, "Renamed");

        store.delete(&id).await.unwrap();
        assert!(!store.exists(&id).await);
        assert!(matches!(
            store.delete(&id).await.unwrap_err(),
            MemoryError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn search_requires_all_terms_and_skips_summaries() {
        let (_dir, store) = store().await;
        let id = ThreadId::generate();
        store
            .append(
                &id,
                &[
                    Message::user("The Deploy KEY lives in vault"),
                    Message::assistant(format!("{SUMMARY_PREFIX} deploy key discussed")),
                    Message::user("deploy tomorrow"),
                    Message::assistant("key rotation done before deploy"),
                ],
            )
            .await
            .unwrap();

        let hits = store.search(&id, "deploy key", 10).await.unwrap();
        assert_eq!(hits.iter().map(|h| h.index).collect::<Vec<_>>(), [3, 0]);

        let limited = store.search(&id, "deploy", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].index, 3);

        assert!(store.search(&id, "   ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_is_append_only() {
        let (dir, store) = store().await;
        let id: ThreadId = "t".parse().unwrap();
        store.append(&id, &[Message::user("one")]).await.unwrap();
        let path = dir.path().join("threads/t.jsonl");
        let before = tokio::fs::read(&path).await.unwrap();
        store.append(&id, &[Message::user("two")]).await.unwrap();
        let after = tokio::fs::read(&path).await.unwrap();
        assert!(after.starts_with(&before));

        let mut f = tokio::fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        f.write_all(b"\n\n").await.unwrap();
        assert_eq!(store.load(&id).await.unwrap().len(), 2);
    }
}
