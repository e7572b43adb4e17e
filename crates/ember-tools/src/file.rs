use std::path::PathBuf;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::executor::ToolError;
use crate::tool::TypedTool;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadParams {
    /// File to read
    pub path: PathBuf,
    /// First line to return, 0-based
    #[serde(default)]
    pub offset: Option<usize>,
    /// Maximum number of lines
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default)]
pub struct ReadFileTool;

impl TypedTool for ReadFileTool {
    type Params = ReadParams;

    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file, optionally a line range."
    }

    async fn run(&self, params: ReadParams) -> Result<String, ToolError> {
        let content = tokio::fs::read_to_string(&params.path).await?;
        if params.offset.is_none() && params.limit.is_none() {
            return Ok(content);
        }
        let selected: Vec<&str> = content
            .lines()
            .skip(params.offset.unwrap_or(0))
            .take(params.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(selected.join("\n"))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteParams {
    /// File to write; parent directories are created
    pub path: PathBuf,
    pub content: String,
    /// Append instead of overwrite
    #[serde(default)]
    pub append: bool,
}

#[derive(Debug, Default)]
pub struct WriteFileTool;

impl TypedTool for WriteFileTool {
    type Params = WriteParams;

    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text to a file, replacing it unless append is set."
    }

    async fn run(&self, params: WriteParams) -> Result<String, ToolError> {
        use tokio::io::AsyncWriteExt;

        if let Some(parent) = params.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        if params.append {
            let mut f = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&params.path)
                .await?;
            f.write_all(params.content.as_bytes()).await?;
        } else {
            tokio::fs::write(&params.path, params.content.as_bytes()).await?;
        }
        Ok(format!(
            "wrote {} bytes to {}",
            params.content.len(),
            params.path.display()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/notes.txt");
        WriteFileTool
            .run(WriteParams {
                path: path.clone(),
                content: "a\nb\nc\n".into(),
                append: false,
            })
            .await
            .unwrap();
        WriteFileTool
            .run(WriteParams {
                path: path.clone(),
                content: "d\n".into(),
                append: true,
            })
            .await
            .unwrap();

        let all = ReadFileTool
            .run(ReadParams {
                path: path.clone(),
                offset: None,
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(all, "a\nb\nc\nd\n");

        let part = ReadFileTool
            .run(ReadParams {
                path,
                offset: Some(1),
                limit: Some(2),
            })
            .await
            .unwrap();
        assert_eq!(part, "b\nc");
    }

    #[tokio::test]
    async fn missing_file_is_execution_error() {
        let err = ReadFileTool
            .run(ReadParams {
                path: "/definitely/not/here".into(),
                offset: None,
                limit: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Execution(_)));
    }
}
