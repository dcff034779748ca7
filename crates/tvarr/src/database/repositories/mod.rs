//! Repository layer: typed access to the store.
//!
//! Repositories own the entity↔model translation (ULIDs and enums are
//! strings in the store) and every cross-row invariant: bulk replacement of
//! a source's records happens in one transaction, job claims are optimistic
//! single-row updates.

pub mod channel;
pub mod epg_program;
pub mod epg_source;
pub mod job;
pub mod rule;
pub mod stream_proxy;
pub mod stream_source;

pub use channel::{ChannelRepository, NewChannel};
pub use epg_program::{EpgProgramRepository, NewEpgProgram};
pub use epg_source::{EpgSourceCreate, EpgSourceRepository};
pub use job::{JobEnqueue, JobRepository};
pub use rule::RuleRepository;
pub use stream_proxy::{StreamProxyCreate, StreamProxyRepository};
pub use stream_source::{StreamSourceCreate, StreamSourceRepository};

use crate::errors::{AppError, AppResult};
use ulid::Ulid;

pub(crate) fn parse_ulid(value: &str) -> AppResult<Ulid> {
    Ulid::from_string(value)
        .map_err(|e| AppError::internal(format!("corrupt record id '{value}': {e}")))
}

pub(crate) fn parse_enum<T>(value: &str, what: &'static str) -> AppResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| AppError::internal(format!("corrupt {what} value '{value}': {e}")))
}
