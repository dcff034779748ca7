//! SeaORM entities backing the repositories.
//!
//! Columns mirror the domain models with store-friendly types: ULIDs and
//! enums are strings, durations are integer milliseconds. Conversions live
//! in the repository layer.

pub mod channels;
pub mod data_mapping_rules;
pub mod epg_programs;
pub mod epg_sources;
pub mod filters;
pub mod job_history;
pub mod jobs;
pub mod prelude;
pub mod proxy_epg_sources;
pub mod proxy_sources;
pub mod stream_proxies;
pub mod stream_sources;
