// Upstream byte sources: the resolved playback URL opened as a readable stream.

pub mod http_source;
pub mod traits;
