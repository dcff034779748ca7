//! Job handler contract and dispatch registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::AppResult;
use crate::models::{Job, JobKind};

/// Execution context handed to a handler: the claimed row plus the
/// cooperative cancellation token for this attempt.
pub struct JobContext {
    pub job: Job,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Run one attempt. The optional string lands in the job row's result
    /// column on success.
    async fn run(&self, ctx: &JobContext) -> AppResult<Option<String>>;
}

/// Kind-keyed handler registry. A job whose kind has no handler fails
/// terminally at dispatch.
#[derive(Default)]
pub struct JobExecutor {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl JobExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn handler_for(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn registered_kinds(&self) -> Vec<JobKind> {
        self.handlers.keys().copied().collect()
    }
}
