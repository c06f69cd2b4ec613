// Engine control: the line transport and the per-content session state machine.

pub mod link;
pub mod protocol;
pub mod session;
pub mod signal;

pub use protocol::{StartKind, StartParams, StartRequest};
pub use session::{AuthState, Credentials, Demographics, EngineSession, PlaybackState, SessionOptions};
