use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use ember_core::agent::{Agent, AgentEvent, TurnOutcome, TurnRequest, TurnStatus};
use ember_llm::Attachment;
use ember_llm::openai::OpenAiProvider;
use ember_memory::ThreadId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const HELP: &str = "\
/new           start a new thread
/thread        print the current thread id
/image <path>  attach an image to the next message
/help          show this help
/quit          leave (also /exit or Ctrl-D)";

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Empty,
    Quit,
    New,
    Help,
    Thread,
    Image(PathBuf),
    Unknown(String),
    Message(String),
}

fn parse_line(line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Empty;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Input::Message(trimmed.to_owned());
    };
    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(n, r)| (n, r.trim()));
    match name {
        "quit" | "exit" => Input::Quit,
        "new" => Input::New,
        "help" => Input::Help,
        "thread" => Input::Thread,
        "image" if !rest.is_empty() => Input::Image(PathBuf::from(rest)),
        _ => Input::Unknown(name.to_owned()),
    }
}

/// Interactive loop over stdin. Each line is one turn in the current thread.
pub async fn run(agent: &Agent<OpenAiProvider>, thread: Option<ThreadId>) -> anyhow::Result<()> {
    let mut thread = thread;
    let mut pending: Vec<Attachment> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    match &thread {
        Some(id) => eprintln!("ember: resuming thread {id}. /help for commands."),
        None => eprintln!("ember: new conversation. /help for commands."),
    }

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        let text = match parse_line(&line) {
            Input::Empty => continue,
            Input::Quit => break,
            Input::New => {
                thread = None;
                pending.clear();
                eprintln!("started a new thread");
                continue;
            }
            Input::Help => {
                eprintln!("{HELP}");
                continue;
            }
            Input::Thread => {
                match &thread {
                    Some(id) => eprintln!("{id}"),
                    None => eprintln!("no thread yet; it is created with the first message"),
                }
                continue;
            }
            Input::Image(path) => {
                match load_image(&path).await {
                    Ok(image) => {
                        pending.push(image);
                        eprintln!("attached {}", path.display());
                    }
                    Err(e) => eprintln!("cannot attach {}: {e}", path.display()),
                }
                continue;
            }
            Input::Unknown(name) => {
                eprintln!("unknown command /{name}; try /help");
                continue;
            }
            Input::Message(text) => text,
        };

        let mut request = TurnRequest::new(text).with_attachments(std::mem::take(&mut pending));
        if let Some(id) = &thread {
            request = request.in_thread(id.clone());
        }

        tokio::select! {
            result = turn_with_output(agent, request) => match result {
                Ok(outcome) => thread = Some(outcome.thread),
                Err(e) => {
                    tracing::error!("turn failed: {e:#}");
                    eprintln!("error: {e}");
                }
            },
            _ = tokio::signal::ctrl_c() => eprintln!("\ninterrupted"),
        }
    }

    if let Some(id) = &thread {
        eprintln!("\nthread {id}");
    }
    Ok(())
}

/// One turn with no interaction. The thread id goes to stderr so the reply can be piped.
pub async fn ask(
    agent: &Agent<OpenAiProvider>,
    thread: Option<ThreadId>,
    message: String,
) -> anyhow::Result<()> {
    let mut request = TurnRequest::new(message);
    if let Some(id) = thread {
        request = request.in_thread(id);
    }
    let outcome = turn_with_output(agent, request).await?;
    eprintln!("thread {}", outcome.thread);
    Ok(())
}

async fn turn_with_output(
    agent: &Agent<OpenAiProvider>,
    request: TurnRequest,
) -> anyhow::Result<TurnOutcome> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut streamed = false;
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Content(chunk) => {
                    streamed = true;
                    print!("{chunk}");
                    let _ = std::io::stdout().flush();
                }
                AgentEvent::Reasoning(_) => {}
                AgentEvent::ToolStarted { name, arguments, .. } => {
                    if streamed {
                        println!();
                        streamed = false;
                    }
                    eprintln!("  -> {name} {}", preview(&arguments, 80));
                }
                AgentEvent::ToolFinished {
                    name,
                    output,
                    is_error,
                    ..
                } => {
                    let mark = if is_error { "failed" } else { "ok" };
                    eprintln!("  <- {name} {mark}: {}", preview(&output, 80));
                }
                AgentEvent::Status(status) => eprintln!("[{status}]"),
            }
        }
        streamed
    });

    let result = agent.run_turn(request, Some(&tx)).await;
    drop(tx);
    let streamed = printer.await.unwrap_or(false);

    let outcome = result?;
    if outcome.status == TurnStatus::Completed && streamed {
        println!();
    } else {
        println!("{}", outcome.reply);
    }
    tracing::debug!(
        rounds = outcome.rounds,
        tool_calls = outcome.tool_calls,
        status = ?outcome.status,
        "turn finished"
    );
    Ok(outcome)
}

async fn load_image(path: &Path) -> std::io::Result<Attachment> {
    let mime_type = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "expected a png, jpeg, gif or webp file",
            ));
        }
    };
    let bytes = tokio::fs::read(path).await?;
    Ok(Attachment {
        mime_type: mime_type.to_owned(),
        data: base64::engine::general_purpose::STANDARD.encode(bytes),
    })
}

pub(crate) fn preview(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(parse_line("  hello there \n"), Input::Message("hello there".into()));
        assert_eq!(parse_line("   "), Input::Empty);
    }

    #[test]
    fn slash_commands() {
        assert_eq!(parse_line("/quit"), Input::Quit);
        assert_eq!(parse_line("/exit"), Input::Quit);
        assert_eq!(parse_line("/new"), Input::New);
        assert_eq!(parse_line("/help"), Input::Help);
        assert_eq!(parse_line("/thread"), Input::Thread);
        assert_eq!(
            parse_line("/image  shots/a b.png "),
            Input::Image(PathBuf::from("shots/a b.png"))
        );
    }

    #[test]
    fn image_without_path_is_unknown() {
        assert_eq!(parse_line("/image"), Input::Unknown("image".into()));
        assert_eq!(parse_line("/frobnicate x"), Input::Unknown("frobnicate".into()));
    }

    #[tokio::test]
    async fn image_is_base64_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dot.PNG");
        tokio::fs::write(&path, [0x89, b'P', b'N', b'G']).await.unwrap();
        let image = load_image(&path).await.unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.data, "iVBORw==");
    }

    #[tokio::test]
    async fn unsupported_image_type_is_rejected() {
        let err = load_image(Path::new("notes.txt")).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("ab", 5), "ab");
        assert_eq!(preview("ééééé", 2), "éé...");
    }
}
