pub mod controller;
pub mod message;
pub mod session;
pub mod stream;

pub use controller::{
    ControllerError, ControllerResult, GenerationOutcome, StreamController, StreamHandle,
};
pub use message::{ChatMessage, MessageKind, NoticeKind, classify};
pub use session::{ChatSession, DEFAULT_SESSION_TITLE};
pub use stream::{GenerationId, StreamOutcome, StreamState, StreamTarget};
