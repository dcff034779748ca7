//! Applies data-mapping rules: stream domain over channels, then epg
//! domain over programs. All enabled rules run in priority order; each
//! rule's actions apply in listed order, and later rules see the
//! already-rewritten fields.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::database::repositories::RuleRepository;
use crate::errors::AppResult;
use crate::expression::{ExpressionDomain, RuleCache};
use crate::models::RuleDomain;
use crate::pipeline::{PipelineContext, PipelineStage};

pub struct DataMappingStage {
    rules: RuleRepository,
    cache: Arc<RuleCache>,
}

impl DataMappingStage {
    pub fn new(rules: RuleRepository, cache: Arc<RuleCache>) -> Self {
        Self { rules, cache }
    }
}

#[async_trait]
impl PipelineStage for DataMappingStage {
    fn name(&self) -> &'static str {
        "data_mapping"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> AppResult<()> {
        let mut mutated = 0usize;

        for domain in [RuleDomain::Stream, RuleDomain::Epg] {
            let rules = self.rules.active_mappings(domain).await?;
            if rules.is_empty() {
                continue;
            }
            for rule in &rules {
                let compiled = match self.cache.get_or_compile(
                    rule.id,
                    rule.updated_at,
                    &rule.expression,
                    ExpressionDomain::from(domain),
                ) {
                    Ok(compiled) => compiled,
                    Err(e) => {
                        // A rule that no longer compiles is skipped, not fatal:
                        // save-time validation should have caught it.
                        warn!(rule = %rule.name, error = %e, "skipping uncompilable mapping rule");
                        continue;
                    }
                };

                match domain {
                    RuleDomain::Stream => {
                        for channel in ctx.channels.iter_mut() {
                            let outcome = compiled.apply(channel);
                            if outcome.matched {
                                ctx.counters.count_rule_match(&rule.name);
                            }
                            if outcome.mutated {
                                mutated += 1;
                            }
                        }
                    }
                    RuleDomain::Epg => {
                        for program in ctx.programs.iter_mut() {
                            let outcome = compiled.apply(program);
                            if outcome.matched {
                                ctx.counters.count_rule_match(&rule.name);
                            }
                            if outcome.mutated {
                                mutated += 1;
                            }
                        }
                    }
                }
            }
        }

        debug!(proxy = %ctx.proxy.name, mutations = mutated, "applied data-mapping rules");
        ctx.counters
            .record("data_mapping", ctx.channels.len() + ctx.programs.len(), 0);
        ctx.stage_progress("data_mapping", 100.0, &format!("{mutated} rewrites"));
        Ok(())
    }
}
