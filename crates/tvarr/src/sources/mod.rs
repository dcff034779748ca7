//! Ingestion handlers: upstream playlists and guides into canonical
//! channel/program rows, selected by source kind.

pub mod factory;
pub mod m3u;
pub mod traits;
pub mod xmltv;
pub mod xtream;

pub use factory::SourceHandlerFactory;
pub use traits::{EpgSourceHandler, IngestOutcome, StreamSourceHandler, INGEST_STAGES};
