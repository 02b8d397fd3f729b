use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use natter::chat::{ChatMessage, ChatSession, StreamHandle, StreamOutcome};
use natter::settings::AppConfig;
use natter::{AppError, ChatApp};
use natter_llm::{
    BoxFuture, ChunkSource, ChunkStream, Role, StreamChunk, StreamRequest, TransportError,
    TransportResult,
};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const ECHO_SOURCE_ID: &str = "echo";
const ECHO_CHUNK_DELAY: Duration = Duration::from_millis(60);

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("{source}"))]
    App { source: AppError },
    #[snafu(display("terminal I/O failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

/// Offline source that streams the prompt back word by word.
struct EchoSource;

impl ChunkSource for EchoSource {
    fn id(&self) -> &str {
        ECHO_SOURCE_ID
    }

    fn open<'a>(
        &'a self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, TransportResult<ChunkStream>> {
        Box::pin(async move {
            let prompt = request
                .messages
                .iter()
                .rev()
                .find(|message| message.role == Role::User)
                .map(|message| message.content.clone())
                .unwrap_or_default();
            let reply = format!("({}) you said: {prompt}", request.model_id());

            let mut chunks = vec![StreamChunk::loading("thinking", None)];
            chunks.extend(reply.split_inclusive(' ').map(StreamChunk::delta));

            let stream = futures::stream::iter(chunks)
                .then(|chunk| async move {
                    tokio::time::sleep(ECHO_CHUNK_DELAY).await;
                    Ok::<_, TransportError>(chunk)
                })
                .take_until(cancel.cancelled_owned());
            Ok(stream.boxed())
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "natter exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), CliError> {
    let app = ChatApp::open(AppConfig::load(), Arc::new(EchoSource))
        .await
        .context(AppSnafu)?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    emit("natter: type a message, /new, /abort or /quit\n").await;
    while let Some(line) = lines.next_line().await.context(TerminalSnafu {
        stage: "read-line",
    })? {
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/abort" => {
                if !app.abort() {
                    emit("nothing to abort\n").await;
                }
            }
            "/new" => {
                let session = app.new_session("").await.context(AppSnafu)?;
                emit(&format!("started session {}\n", session.id)).await;
            }
            prompt => match app.submit(prompt).await {
                Ok(handle) => {
                    tokio::spawn(print_reply(handle));
                }
                Err(error) => emit(&format!("error: {error}\n")).await,
            },
        }
    }

    app.shutdown().await;
    Ok(())
}

/// Prints the reply as it grows, then how the generation ended.
async fn print_reply(handle: StreamHandle) {
    let mut updates = handle.updates();
    let mut printed = 0;

    while handle.is_streaming() {
        let text = assistant_text(&updates.borrow_and_update());
        printed += emit_suffix(&text, printed).await;
        if updates.changed().await.is_err() {
            break;
        }
    }

    match handle.finished().await {
        Ok(finished) => {
            let text = finished
                .session
                .messages
                .iter()
                .rev()
                .find(|message| message.is_assistant())
                .map(|message| message.text().to_string())
                .unwrap_or_default();
            emit_suffix(&text, printed).await;
            let status = match finished.outcome {
                StreamOutcome::Completed => String::new(),
                StreamOutcome::Aborted => " [aborted]".to_string(),
                StreamOutcome::Errored { message } => format!(" [error: {message}]"),
            };
            emit(&format!("{status}\n")).await;
        }
        Err(error) => tracing::error!(error = %error, "generation task failed"),
    }
}

fn assistant_text(session: &ChatSession) -> String {
    match session.last() {
        Some(ChatMessage::Assistant(reply)) => reply.content.clone(),
        _ => String::new(),
    }
}

async fn emit_suffix(text: &str, printed: usize) -> usize {
    match text.get(printed..) {
        Some(rest) if !rest.is_empty() => {
            emit(rest).await;
            rest.len()
        }
        _ => 0,
    }
}

async fn emit(text: &str) {
    let mut stdout = tokio::io::stdout();
    let written = async {
        stdout.write_all(text.as_bytes()).await?;
        stdout.flush().await
    };
    if let Err(error) = written.await {
        tracing::warn!(error = %error, "failed to write to stdout");
    }
}
