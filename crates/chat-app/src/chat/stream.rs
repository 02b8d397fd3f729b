use std::fmt;

use natter_storage::SessionId;

/// Identifier for one generation.
///
/// Changes on every start so events from a finished generation can be told
/// apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationId(pub u64);

impl fmt::Display for GenerationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Routing key for stream events: which session, which generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub session_id: SessionId,
    pub generation: GenerationId,
}

impl StreamTarget {
    pub const fn new(session_id: SessionId, generation: GenerationId) -> Self {
        Self {
            session_id,
            generation,
        }
    }
}

/// Lifecycle of the generation bound to one session.
///
/// `Completed`, `Aborted` and `Errored` are transit states: the controller
/// records the outcome and settles back to `Idle` in the same step.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming(StreamTarget),
    Completed(StreamTarget),
    Aborted(StreamTarget),
    Errored {
        target: StreamTarget,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamTarget),
    Complete(StreamTarget),
    Abort(StreamTarget),
    Fail {
        target: StreamTarget,
        message: String,
    },
    Settle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveStream,
    GenerationMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

/// How a generation ended, as reported to whoever started it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Aborted,
    Errored { message: String },
}

impl StreamState {
    pub fn active_target(&self) -> Option<StreamTarget> {
        match self {
            Self::Streaming(target) => Some(*target),
            Self::Idle | Self::Completed(_) | Self::Aborted(_) | Self::Errored { .. } => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }

    /// True when an event for `target` may still change the session.
    pub fn accepts_stream_event(&self, target: StreamTarget) -> bool {
        matches!(self, Self::Streaming(active) if *active == target)
    }

    /// Applies one transition.
    ///
    /// Any non-streaming state may start. A second start while streaming is
    /// rejected even for the same target. Terminal transitions must name the
    /// active generation exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(target) => self.apply_start(target),
            StreamTransition::Complete(target) => {
                self.apply_terminal(target, || Self::Completed(target))
            }
            StreamTransition::Abort(target) => self.apply_terminal(target, || Self::Aborted(target)),
            StreamTransition::Fail { target, message } => {
                self.apply_terminal(target, || Self::Errored { target, message })
            }
            StreamTransition::Settle => self.apply_settle(),
        }
    }

    fn apply_start(&self, target: StreamTarget) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) => Err(StreamTransitionRejection::AlreadyStreaming {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Completed(_) | Self::Aborted(_) | Self::Errored { .. } => {
                Ok(Self::Streaming(target))
            }
        }
    }

    fn apply_terminal(
        &self,
        target: StreamTarget,
        next: impl FnOnce() -> StreamState,
    ) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == target => Ok(next()),
            Self::Streaming(active) => Err(StreamTransitionRejection::GenerationMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Completed(_) | Self::Aborted(_) | Self::Errored { .. } => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }

    fn apply_settle(&self) -> StreamTransitionResult {
        match self {
            Self::Streaming(_) => Err(StreamTransitionRejection::NoActiveStream),
            Self::Idle | Self::Completed(_) | Self::Aborted(_) | Self::Errored { .. } => {
                Ok(Self::Idle)
            }
        }
    }

    /// The outcome a terminal state stands for.
    pub fn outcome(&self) -> Option<StreamOutcome> {
        match self {
            Self::Completed(_) => Some(StreamOutcome::Completed),
            Self::Aborted(_) => Some(StreamOutcome::Aborted),
            Self::Errored { message, .. } => Some(StreamOutcome::Errored {
                message: message.clone(),
            }),
            Self::Idle | Self::Streaming(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(generation: u64) -> StreamTarget {
        let session_id = SessionId::parse("00000000-0000-0000-0000-000000000042").unwrap();
        StreamTarget::new(session_id, GenerationId(generation))
    }

    #[test]
    fn full_cycle_returns_to_idle() {
        let first = target(1);
        let streaming = StreamState::Idle
            .apply(StreamTransition::Start(first))
            .unwrap();
        assert!(streaming.is_streaming());
        assert!(streaming.accepts_stream_event(first));

        let completed = streaming.apply(StreamTransition::Complete(first)).unwrap();
        assert_eq!(completed.outcome(), Some(StreamOutcome::Completed));
        assert_eq!(
            completed.apply(StreamTransition::Settle).unwrap(),
            StreamState::Idle
        );
    }

    #[test]
    fn start_while_streaming_is_rejected() {
        let streaming = StreamState::Streaming(target(1));
        assert_eq!(
            streaming.apply(StreamTransition::Start(target(1))),
            Err(StreamTransitionRejection::AlreadyStreaming {
                active: target(1),
                attempted: target(1),
            })
        );
        assert!(matches!(
            streaming.apply(StreamTransition::Start(target(2))),
            Err(StreamTransitionRejection::AlreadyStreaming { .. })
        ));
    }

    #[test]
    fn stale_generation_cannot_finish_the_active_one() {
        let streaming = StreamState::Streaming(target(2));
        assert!(!streaming.accepts_stream_event(target(1)));
        assert_eq!(
            streaming.apply(StreamTransition::Abort(target(1))),
            Err(StreamTransitionRejection::GenerationMismatch {
                active: target(2),
                attempted: target(1),
            })
        );
        assert_eq!(
            StreamState::Idle.apply(StreamTransition::Complete(target(2))),
            Err(StreamTransitionRejection::NoActiveStream)
        );
    }

    #[test]
    fn streaming_cannot_settle_directly() {
        let streaming = StreamState::Streaming(target(3));
        assert_eq!(
            streaming.apply(StreamTransition::Settle),
            Err(StreamTransitionRejection::NoActiveStream)
        );

        let errored = streaming
            .apply(StreamTransition::Fail {
                target: target(3),
                message: "reset".to_string(),
            })
            .unwrap();
        assert_eq!(
            errored.outcome(),
            Some(StreamOutcome::Errored {
                message: "reset".to_string()
            })
        );
    }
}
