//! Build, test and commit steps, behind traits so tests and other platforms can swap them.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::process::Command;

/// Outcome of one toolchain step with its combined output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StepOutput {
    pub ok: bool,
    pub output: String,
}

impl StepOutput {
    #[must_use]
    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: output.into(),
        }
    }
}

pub trait Toolchain: Send + Sync {
    /// Compile the tree at `source` and place the resulting binary at `output`.
    fn build<'a>(&'a self, source: &'a Path, output: &'a Path) -> BoxFuture<'a, StepOutput>;

    /// Run the full test suite of the tree at `source`.
    fn test<'a>(&'a self, source: &'a Path) -> BoxFuture<'a, StepOutput>;
}

pub trait Vcs: Send + Sync {
    /// Commit every change under `root` and return the commit id.
    fn commit<'a>(&'a self, root: &'a Path, message: &'a str) -> BoxFuture<'a, Result<String, String>>;
}

#[derive(Debug, Clone)]
pub struct CargoToolchain {
    bin_name: String,
    timeout: Duration,
}

impl CargoToolchain {
    #[must_use]
    pub fn new(bin_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin_name: bin_name.into(),
            timeout,
        }
    }

    fn built_binary(&self, source: &Path) -> PathBuf {
        let target = std::env::var_os("CARGO_TARGET_DIR")
            .map_or_else(|| source.join("target"), PathBuf::from);
        target.join("release").join(&self.bin_name)
    }
}

impl Toolchain for CargoToolchain {
    fn build<'a>(&'a self, source: &'a Path, output: &'a Path) -> BoxFuture<'a, StepOutput> {
        async move {
            let mut step = run(
                "cargo",
                &["build", "--release", "--bin", &self.bin_name],
                source,
                self.timeout,
            )
            .await;
            if step.ok {
                let built = self.built_binary(source);
                if let Err(e) = tokio::fs::copy(&built, output).await {
                    step.ok = false;
                    let _ = write!(
                        step.output,
                        "\nfailed to copy {} to {}: {e}",
                        built.display(),
                        output.display()
                    );
                }
            }
            step
        }
        .boxed()
    }

    fn test<'a>(&'a self, source: &'a Path) -> BoxFuture<'a, StepOutput> {
        run("cargo", &["test", "--release"], source, self.timeout).boxed()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GitVcs;

impl Vcs for GitVcs {
    fn commit<'a>(&'a self, root: &'a Path, message: &'a str) -> BoxFuture<'a, Result<String, String>> {
        async move {
            let timeout = Duration::from_secs(60);
            for args in [&["add", "-A"][..], &["commit", "-m", message][..]] {
                let step = run("git", args, root, timeout).await;
                if !step.ok {
                    return Err(step.output);
                }
            }
            let head = run("git", &["rev-parse", "HEAD"], root, timeout).await;
            if head.ok {
                Ok(head.output.trim().to_owned())
            } else {
                Err(head.output)
            }
        }
        .boxed()
    }
}

async fn run(program: &str, args: &[&str], cwd: &Path, timeout: Duration) -> StepOutput {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    tracing::debug!(program, ?args, cwd = %cwd.display(), "running toolchain step");
    match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => StepOutput::failed(format!(
            "{program} {} timed out after {}s",
            args.join(" "),
            timeout.as_secs()
        )),
        Ok(Err(e)) => StepOutput::failed(format!("failed to run {program}: {e}")),
        Ok(Ok(out)) => {
            let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !stderr.is_empty() {
                if !output.is_empty() && !output.ends_with('\n') {
                    output.push('\n');
                }
                output.push_str(&stderr);
            }
            StepOutput {
                ok: out.status.success(),
                output,
            }
        }
    }
}
