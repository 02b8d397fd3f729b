use std::time::Duration;

use parking_lot::Mutex;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use super::chunk::StreamChunk;
use super::provider::{
    BoxFuture, ChunkSource, ChunkStream, OpenSnafu, ProviderSnafu, StreamRequest, TransportError,
    TransportResult,
};

pub const SCRIPTED_SOURCE_ID: &str = "scripted";

/// One step of a scripted generation.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Chunk(StreamChunk),
    /// Waits before the next step; cancellation cuts the wait short.
    Delay(Duration),
    /// Yields a transport failure and ends the sequence.
    Fail(String),
    /// Produces nothing until cancelled.
    Hang,
}

/// Chunk source that replays a fixed script, recording every request.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: Vec<ScriptStep>,
    open_failure: Option<String>,
    require_api_key: bool,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedSource {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Content deltas followed by a clean end of stream.
    pub fn deltas<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            deltas
                .into_iter()
                .map(|delta| ScriptStep::Chunk(StreamChunk::delta(delta)))
                .collect(),
        )
    }

    pub fn failing_open(details: impl Into<String>) -> Self {
        Self {
            open_failure: Some(details.into()),
            ..Self::default()
        }
    }

    /// Rejects requests whose provider has no API key, like a real client would.
    pub fn requiring_api_key(mut self) -> Self {
        self.require_api_key = true;
        self
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }
}

impl ChunkSource for ScriptedSource {
    fn id(&self) -> &str {
        SCRIPTED_SOURCE_ID
    }

    fn open<'a>(
        &'a self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, TransportResult<ChunkStream>> {
        Box::pin(async move {
            let provider_id = request.provider_id.clone();
            let credential_check = if self.require_api_key {
                request.provider.require_api_key(&provider_id).map(|_| ())
            } else {
                Ok(())
            };
            self.requests.lock().push(request);

            credential_check.context(ProviderSnafu {
                stage: "scripted-open",
                provider_id: provider_id.clone(),
            })?;

            if let Some(details) = &self.open_failure {
                return OpenSnafu {
                    stage: "scripted-open",
                    provider_id,
                    details: details.clone(),
                }
                .fail();
            }

            tracing::debug!(provider_id = %provider_id, steps = self.script.len(), "replaying script");
            Ok(replay(self.script.clone(), cancel))
        })
    }
}

fn replay(script: Vec<ScriptStep>, cancel: CancellationToken) -> ChunkStream {
    let stream = futures::stream::unfold(
        (script.into_iter(), cancel, false),
        |(mut steps, cancel, failed)| async move {
            if failed {
                return None;
            }

            loop {
                if cancel.is_cancelled() {
                    return None;
                }

                match steps.next()? {
                    ScriptStep::Chunk(chunk) => return Some((Ok(chunk), (steps, cancel, false))),
                    ScriptStep::Delay(duration) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return None,
                            _ = tokio::time::sleep(duration) => {}
                        }
                    }
                    ScriptStep::Fail(details) => {
                        let error = TransportError::Chunk {
                            stage: "scripted-chunk",
                            details,
                        };
                        return Some((Err(error), (steps, cancel, true)));
                    }
                    ScriptStep::Hang => {
                        cancel.cancelled().await;
                        return None;
                    }
                }
            }
        },
    );

    Box::pin(stream)
}
