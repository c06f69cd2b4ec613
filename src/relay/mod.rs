// Request relay: session sharing across clients and the per-request stream pipeline.

pub mod broadcast;
pub mod directory;
pub mod orchestrator;
pub mod registry;
pub mod stats;

pub use orchestrator::{EngineConnector, EngineRegistry, RelayOrchestrator, RelayRequest, TcpEngineConnector};
pub use directory::{ChannelDirectory, HttpChannelDirectory};
pub use registry::SessionRegistry;
