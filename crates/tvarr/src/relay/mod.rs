//! The live relay engine: one upstream pull per (channel, variant)
//! session, probed codecs, a passthrough/repackage/transcode routing
//! decision, and bounded-buffer fan-out to clients.

pub mod buffer;
pub mod classification;
pub mod manager;
pub mod probe;
pub mod routing;
pub mod segmenter;
pub mod session;
pub mod transcoder;

pub use classification::ClientClassifier;
pub use manager::RelayManager;
pub use probe::StreamProber;
pub use session::{chunk_stream, RelayClient, RelaySession};
pub use transcoder::{LocalFfmpegTranscoder, Transcoder};
