//! Applies filter rules: ascending priority, first matching rule decides
//! include/exclude, unmatched records are kept.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::database::repositories::RuleRepository;
use crate::errors::AppResult;
use crate::expression::{CompiledExpression, ExpressionDomain, FieldAccess, RuleCache};
use crate::models::{FilterAction, FilterRule, RuleDomain};
use crate::pipeline::{PipelineContext, PipelineStage, StageCounters};

pub struct FilteringStage {
    rules: RuleRepository,
    cache: Arc<RuleCache>,
}

impl FilteringStage {
    pub fn new(rules: RuleRepository, cache: Arc<RuleCache>) -> Self {
        Self { rules, cache }
    }

    fn compile(
        &self,
        rules: &[FilterRule],
        domain: RuleDomain,
    ) -> Vec<(FilterRule, Arc<CompiledExpression>)> {
        rules
            .iter()
            .filter_map(|rule| {
                match self.cache.get_or_compile(
                    rule.id,
                    rule.updated_at,
                    &rule.expression,
                    ExpressionDomain::from(domain),
                ) {
                    Ok(compiled) => Some((rule.clone(), compiled)),
                    Err(e) => {
                        warn!(rule = %rule.name, error = %e, "skipping uncompilable filter");
                        None
                    }
                }
            })
            .collect()
    }
}

/// First matching rule (rules pre-sorted by priority) decides the fate.
fn keeps(
    record: &dyn FieldAccess,
    compiled: &[(FilterRule, Arc<CompiledExpression>)],
    counters: &mut StageCounters,
) -> bool {
    for (rule, expression) in compiled {
        if expression.matches(record) {
            counters.count_rule_match(&rule.name);
            return rule.action == FilterAction::Include;
        }
    }
    true
}

#[async_trait]
impl PipelineStage for FilteringStage {
    fn name(&self) -> &'static str {
        "filtering"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> AppResult<()> {
        let stream_rules = self.rules.active_filters(RuleDomain::Stream).await?;
        let compiled = self.compile(&stream_rules, RuleDomain::Stream);

        let before = ctx.channels.len();
        if !compiled.is_empty() {
            let mut counters = std::mem::take(&mut ctx.counters);
            ctx.channels
                .retain(|channel| keeps(channel, &compiled, &mut counters));
            ctx.counters = counters;
        }
        let channels_removed = before - ctx.channels.len();
        ctx.counters
            .record("filtering", ctx.channels.len(), channels_removed);

        let epg_rules = self.rules.active_filters(RuleDomain::Epg).await?;
        let compiled = self.compile(&epg_rules, RuleDomain::Epg);

        let before = ctx.programs.len();
        if !compiled.is_empty() {
            let mut counters = std::mem::take(&mut ctx.counters);
            ctx.programs
                .retain(|program| keeps(program, &compiled, &mut counters));
            ctx.counters = counters;
        }
        let programs_removed = before - ctx.programs.len();
        ctx.counters
            .record("filtering_epg", ctx.programs.len(), programs_removed);

        debug!(
            proxy = %ctx.proxy.name,
            channels_removed,
            programs_removed,
            "applied filters"
        );
        ctx.stage_progress(
            "filtering",
            100.0,
            &format!("-{} channels, -{} programs", channels_removed, programs_removed),
        );
        Ok(())
    }
}
