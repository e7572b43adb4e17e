use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

const MAX_ID_LEN: usize = 128;

/// Opaque thread identifier. Restricted to `[A-Za-z0-9_-]` because it names files.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThreadId(String);

impl ThreadId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ThreadId {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= MAX_ID_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(s.to_owned()))
        } else {
            Err(MemoryError::InvalidId(s.to_owned()))
        }
    }
}

impl TryFrom<String> for ThreadId {
    type Error = MemoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ThreadId> for String {
    fn from(id: ThreadId) -> Self {
        id.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMeta {
    pub id: ThreadId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

impl ThreadMeta {
    #[must_use]
    pub fn new(id: ThreadId, title: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            created_at: now,
            updated_at: now,
            message_count: 0,
        }
    }
}

pub const DEFAULT_TITLE: &str = "New conversation";
const TITLE_MAX_CHARS: usize = 60;

/// Title from the first user message: collapsed to one line, cut at a word boundary.
#[must_use]
pub fn derive_title(text: &str) -> String {
    let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if line.is_empty() {
        return DEFAULT_TITLE.to_owned();
    }
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line;
    }
    let mut out = String::new();
    for word in line.split(' ') {
        let extra = usize::from(!out.is_empty()) + word.chars().count();
        if out.chars().count() + extra > TITLE_MAX_CHARS {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    if out.is_empty() {
        out = line.chars().take(TITLE_MAX_CHARS).collect();
    }
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_parse_back() {
        let id = ThreadId::generate();
        let parsed: ThreadId = id.as_str().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn path_like_ids_are_rejected() {
        assert!("../etc".parse::<ThreadId>().is_err());
        assert!("a/b".parse::<ThreadId>().is_err());
        assert!("".parse::<ThreadId>().is_err());
        assert!("ok_id-1".parse::<ThreadId>().is_ok());
    }

    #[test]
    fn thread_id_deserialize_validates() {
        assert!(serde_json::from_str::<ThreadId>("\"a.b\"").is_err());
        assert_eq!(
            serde_json::from_str::<ThreadId>("\"abc\"").unwrap().as_str(),
            "abc"
        );
    }

    #[test]
    fn title_collapses_whitespace() {
        assert_eq!(derive_title("  fix\n the   build "), "fix the build");
    }

    #[test]
    fn title_cuts_at_word_boundary() {
        let text = "please help me refactor the configuration loader so that environment overrides apply last";
        let title = derive_title(text);
        assert!(title.ends_with("..."));
        let body = title.trim_end_matches("...");
        assert!(body.chars().count() <= 60);
        assert!(text.starts_with(body));
        assert!(!body.ends_with(' '));
    }

    #[test]
    fn title_of_single_long_word_is_cut() {
        let title = derive_title(&"x".repeat(100));
        assert_eq!(title.chars().count(), 63);
    }

    #[test]
    fn empty_title_falls_back() {
        assert_eq!(derive_title("   "), DEFAULT_TITLE);
    }
}
