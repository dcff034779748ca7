//! Rule expression engine.
//!
//! One DSL serves three consumers: filter rules (condition only),
//! data-mapping rules (condition plus actions) and relay client-detection
//! rules (condition over request metadata). Rules are validated at save
//! time and compiled once per (rule id, updated_at); evaluation never
//! errors.

pub mod ast;
pub mod evaluator;
pub mod fields;
pub mod lexer;
pub mod parser;

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;
use ulid::Ulid;

use crate::errors::{AppError, AppResult};

pub use evaluator::{CompiledExpression, EvalOutcome};
pub use fields::{ExpressionDomain, FieldAccess, RequestMeta};

/// Parse and compile an expression for a domain. Errors are validation
/// diagnostics naming the offending span or field.
pub fn compile_text(text: &str, domain: ExpressionDomain) -> AppResult<CompiledExpression> {
    let parsed = parser::parse(text).map_err(|e| AppError::validation(e.to_string()))?;
    evaluator::compile(&parsed, domain).map_err(|e| AppError::validation(e.to_string()))
}

/// Save-time validation entry point.
pub fn validate(text: &str, domain: ExpressionDomain) -> AppResult<CompiledExpression> {
    compile_text(text, domain)
}

/// Compiled-rule cache keyed by (rule id, updated_at): an edited rule gets
/// a new key, so stale compilations age out of the LRU naturally.
pub struct RuleCache {
    inner: Mutex<LruCache<(Ulid, DateTime<Utc>), Arc<CompiledExpression>>>,
}

impl RuleCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get_or_compile(
        &self,
        rule_id: Ulid,
        updated_at: DateTime<Utc>,
        text: &str,
        domain: ExpressionDomain,
    ) -> AppResult<Arc<CompiledExpression>> {
        let key = (rule_id, updated_at);
        {
            let mut cache = self.inner.lock().expect("rule cache lock poisoned");
            if let Some(compiled) = cache.get(&key) {
                return Ok(compiled.clone());
            }
        }
        let compiled = Arc::new(compile_text(text, domain)?);
        self.inner
            .lock()
            .expect("rule cache lock poisoned")
            .put(key, compiled.clone());
        Ok(compiled)
    }
}

impl Default for RuleCache {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_filters_and_rejects_garbage() {
        assert!(validate("group_title equals \"Adult\"", ExpressionDomain::Stream).is_ok());
        assert!(validate("title contains \"cup\"", ExpressionDomain::Epg).is_ok());
        assert!(validate("no_such_field equals \"x\"", ExpressionDomain::Stream).is_err());
        assert!(validate("group_title ~~~ \"x\"", ExpressionDomain::Stream).is_err());
    }

    #[test]
    fn cache_reuses_compilations_per_version() {
        let cache = RuleCache::new(8);
        let id = Ulid::new();
        let at = Utc::now();
        let a = cache
            .get_or_compile(id, at, "group_title equals \"x\"", ExpressionDomain::Stream)
            .unwrap();
        let b = cache
            .get_or_compile(id, at, "group_title equals \"x\"", ExpressionDomain::Stream)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // A newer updated_at is a different key.
        let later = at + chrono::Duration::seconds(1);
        let c = cache
            .get_or_compile(id, later, "group_title equals \"y\"", ExpressionDomain::Stream)
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
