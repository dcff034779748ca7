//! Cross-cutting expression engine laws: filter ordering, mapping
//! determinism, and validation/evaluation contracts.

use chrono::Utc;
use proptest::prelude::*;
use ulid::Ulid;

use tvarr::expression::{self, ExpressionDomain};
use tvarr::models::Channel;

fn channel(name: &str, group: &str, number: Option<i32>) -> Channel {
    Channel {
        id: Ulid::new(),
        source_id: Ulid::new(),
        external_id: None,
        tvg_id: None,
        tvg_name: None,
        tvg_logo: None,
        group_title: Some(group.to_string()),
        channel_name: name.to_string(),
        channel_number: number,
        stream_url: "http://up/x.ts".to_string(),
        stream_type: None,
        language: None,
        country: None,
        is_adult: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// First-match-wins: a lower-priority (earlier) rule decides even when a
/// later rule would disagree. Mirrors the filtering stage's walk order.
#[test]
fn earlier_filter_rule_decides_for_records_matching_both() {
    let include_news =
        expression::compile_text("group_title equals \"News\"", ExpressionDomain::Stream).unwrap();
    let exclude_everything =
        expression::compile_text("channel_name is_not_empty", ExpressionDomain::Stream).unwrap();

    let record = channel("BBC News", "News", None);

    // Both match; ordering decides. Evaluate in (include, exclude) order:
    let ordered = [(&include_news, true), (&exclude_everything, false)];
    let mut fate = None;
    for (rule, include) in ordered {
        if rule.matches(&record) {
            fate = Some(include);
            break;
        }
    }
    assert_eq!(fate, Some(true));

    // Reversed priority flips the outcome.
    let ordered = [(&exclude_everything, false), (&include_news, true)];
    let mut fate = None;
    for (rule, include) in ordered {
        if rule.matches(&record) {
            fate = Some(include);
            break;
        }
    }
    assert_eq!(fate, Some(false));
}

#[test]
fn no_matching_rule_keeps_the_record() {
    let rule =
        expression::compile_text("group_title equals \"Sports\"", ExpressionDomain::Stream)
            .unwrap();
    let record = channel("BBC News", "News", None);
    assert!(!rule.matches(&record));
}

/// SET/DELETE-style mappings are idempotent: applying the rule set twice
/// equals applying it once.
#[test]
fn mapping_application_is_idempotent_for_idempotent_actions() {
    let rules = [
        expression::compile_text(
            "group_title equals \"News\" => tvg_name = \"news-feed\", tvg_logo DELETE",
            ExpressionDomain::Stream,
        )
        .unwrap(),
        expression::compile_text(
            "channel_name starts_with \"UK\" => country SET_IF_EMPTY \"GB\"",
            ExpressionDomain::Stream,
        )
        .unwrap(),
    ];

    let mut once = channel("UK Gold", "News", None);
    for rule in &rules {
        rule.apply(&mut once);
    }
    let mut twice = once.clone();
    for rule in &rules {
        rule.apply(&mut twice);
    }
    assert_eq!(once, twice);
}

#[test]
fn later_mapping_rules_see_rewritten_fields() {
    let first = expression::compile_text(
        "group_title equals \"News\" => channel_name PREPEND \"UK: \"",
        ExpressionDomain::Stream,
    )
    .unwrap();
    let second = expression::compile_text(
        "channel_name starts_with \"UK: \" => group_title = \"UK News\"",
        ExpressionDomain::Stream,
    )
    .unwrap();

    let mut record = channel("BBC News", "News", None);
    first.apply(&mut record);
    second.apply(&mut record);
    assert_eq!(record.channel_name, "UK: BBC News");
    assert_eq!(record.group_title.as_deref(), Some("UK News"));
}

#[test]
fn malformed_rules_are_rejected_at_save_time_not_eval_time() {
    for bad in [
        "",
        "group_title",
        "group_title equals",
        "group_title frobs \"x\"",
        "nonexistent_field equals \"x\"",
        "channel_number > \"not-a-number\"",
        "group_title equals \"x\" => tvg_logo FROB \"y\"",
    ] {
        assert!(
            expression::validate(bad, ExpressionDomain::Stream).is_err(),
            "expected rejection: {bad}"
        );
    }
}

proptest! {
    /// Evaluation never panics, whatever the record contents.
    #[test]
    fn eval_total_over_arbitrary_strings(name in ".{0,40}", group in ".{0,20}") {
        let rules = [
            expression::compile_text(
                "channel_name matches \"(\\\\d+)\" => tvg_name = \"n$1\"",
                ExpressionDomain::Stream,
            )
            .unwrap(),
            expression::compile_text(
                "group_title contains \"a\" AND NOT channel_name is_empty",
                ExpressionDomain::Stream,
            )
            .unwrap(),
        ];
        let mut record = channel(&name, &group, None);
        for rule in &rules {
            rule.matches(&record);
            rule.apply(&mut record);
        }
    }

    /// Numeric comparison coerces or yields false, never errors.
    #[test]
    fn numeric_coercion_is_total(number in proptest::option::of(-10000i32..10000)) {
        let rule = expression::compile_text(
            "channel_number greater_than 100",
            ExpressionDomain::Stream,
        )
        .unwrap();
        let record = channel("x", "y", number);
        let matched = rule.matches(&record);
        match number {
            Some(n) => prop_assert_eq!(matched, n > 100),
            None => prop_assert!(!matched),
        }
    }
}
