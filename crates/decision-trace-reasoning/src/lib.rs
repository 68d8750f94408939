#![forbid(unsafe_code)]

//! Deterministic human-readable narratives for filter and ranking steps.
//!
//! Every function here is a pure function of its inputs: the same evaluations
//! and rules always produce byte-identical text.

use std::fmt::Write as _;

use decision_trace_domain::{Evaluation, RankingOutcome, Rule};
use serde_json::Value;

/// Candidates listed individually in a filter breakdown.
pub const BREAKDOWN_LIMIT: usize = 10;
/// Candidates listed in the ranking leaderboard.
pub const LEADERBOARD_LIMIT: usize = 5;
/// Rule details listed per candidate before summarizing the rest.
const DETAIL_LIMIT: usize = 3;

/// One bullet of the "Filters Applied" section, e.g. `cheap (price: ≤50) - Budget`.
#[must_use]
pub fn describe_rule(rule: &Rule) -> String {
    let mut text = format!("{} ({}: {})", rule.name, rule.field, rule.condition_text());
    if !rule.description.trim().is_empty() {
        let _ = write!(text, " - {}", rule.description.trim());
    }
    text
}

/// Narrative for a filter step: headline, rule list, tally and a tree of the
/// best-matching candidates.
#[must_use]
pub fn filter_reasoning(evaluations: &[Evaluation], filters: &[&Rule], step: Option<&str>) -> String {
    if filters.is_empty() {
        return format!(
            "No filters defined for step '{}'. All {} items passed.",
            step.unwrap_or("default"),
            evaluations.len()
        );
    }

    let total = evaluations.len();
    let passed = evaluations.iter().filter(|evaluation| evaluation.is_accepted()).count();
    let failed = total - passed;
    let count = filters.len();
    let names = filters
        .iter()
        .map(|rule| rule.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let mut lines = vec![headline(evaluations, count, passed, &names), String::new()];
    lines.push(format!("Filters Applied ({count} total):"));
    lines.extend(filters.iter().map(|rule| format!("  • {}", describe_rule(rule))));
    lines.push(String::new());
    lines.push(format!(
        "Summary: {passed} out of {total} candidates passed all {count} filter(s), {failed} failed"
    ));
    lines.push(String::new());
    lines.push("Candidates Evaluated:".to_string());

    let ordered = breakdown_order(evaluations);
    let shown = ordered.len().min(BREAKDOWN_LIMIT);
    let remaining = &ordered[shown..];
    for (index, evaluation) in ordered.iter().take(shown).enumerate() {
        let connector = if index + 1 == shown && remaining.is_empty() {
            "└──"
        } else {
            "├──"
        };
        let marker = if evaluation.is_accepted() { "✓" } else { "✗" };
        lines.push(format!(
            "  {connector} {marker} {} - {}",
            evaluation.entity_name,
            candidate_status(evaluation, filters)
        ));
    }
    if !remaining.is_empty() {
        let remaining_passed = remaining
            .iter()
            .filter(|evaluation| evaluation.is_accepted())
            .count();
        lines.push(format!(
            "  └── ... ({} more: {remaining_passed} passed, {} failed)",
            remaining.len(),
            remaining.len() - remaining_passed
        ));
    }

    lines.join("\n")
}

fn headline(evaluations: &[Evaluation], count: usize, passed: usize, names: &str) -> String {
    if passed > 0 {
        let top = evaluations
            .iter()
            .find(|evaluation| evaluation.is_accepted())
            .map_or("Unknown", |evaluation| evaluation.entity_name.as_str());
        return format!(
            "Main Reasoning: {passed} candidate(s) passed all {count} filter(s): {names}. \
             Top candidate: {top}. Candidates are ranked by number of filters passed, then by ranking criteria."
        );
    }

    let best = evaluations
        .iter()
        .map(|evaluation| evaluation.filters_passed)
        .max()
        .unwrap_or(0);
    if best == 0 {
        return format!(
            "Main Reasoning: No candidates passed any of the {count} filter(s): {names}. \
             Candidates are ranked by number of filters passed (0 max), then by ranking criteria."
        );
    }
    let top = evaluations
        .iter()
        .find(|evaluation| evaluation.filters_passed == best)
        .map_or("Unknown", |evaluation| evaluation.entity_name.as_str());
    format!(
        "Main Reasoning: No candidates passed all {count} filter(s): {names}. \
         Top candidate passed {best}/{count} filters: {top}. \
         Candidates are ranked by number of filters passed ({best} max), then by ranking criteria."
    )
}

/// Filters passed descending, then name ascending, then original position.
fn breakdown_order(evaluations: &[Evaluation]) -> Vec<&Evaluation> {
    let mut ordered: Vec<&Evaluation> = evaluations.iter().collect();
    ordered.sort_by(|lhs, rhs| {
        rhs.filters_passed
            .cmp(&lhs.filters_passed)
            .then_with(|| lhs.entity_name.cmp(&rhs.entity_name))
    });
    ordered
}

fn candidate_status(evaluation: &Evaluation, filters: &[&Rule]) -> String {
    let mut passed_details = Vec::new();
    let mut failed_details = Vec::new();
    for check in &evaluation.checks {
        let actual = filters
            .iter()
            .find(|rule| rule.name == check.rule)
            .and_then(|rule| evaluation.attributes.lookup(&rule.field))
            .map_or_else(|| "N/A".to_string(), ToString::to_string);
        let detail = format!("{} (actual: {actual})", check.expected);
        if check.passed {
            passed_details.push(detail);
        } else {
            failed_details.push(detail);
        }
    }

    if evaluation.is_accepted() {
        let mut text = format!("PASSED all {} filters", evaluation.filters_total);
        if !passed_details.is_empty() {
            let _ = write!(text, " - {}", summarize(&passed_details));
        }
        text
    } else if failed_details.is_empty() {
        format!(
            "Passed {}/{} filters",
            evaluation.filters_passed, evaluation.filters_total
        )
    } else {
        format!("FAILED: {}", summarize(&failed_details))
    }
}

fn summarize(details: &[String]) -> String {
    let mut text = details
        .iter()
        .take(DETAIL_LIMIT)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if details.len() > DETAIL_LIMIT {
        let _ = write!(text, " and {} more", details.len() - DETAIL_LIMIT);
    }
    text
}

/// Narrative for a ranking step: why the winner won, the leaderboard and the
/// final recommendation.
#[must_use]
pub fn ranking_reasoning(outcome: &RankingOutcome) -> String {
    let Some(top) = outcome.candidates.first() else {
        return "No candidates available for ranking.".to_string();
    };
    let criteria = outcome.criteria.describe();
    let evaluation = &top.evaluation;
    let name = &evaluation.entity_name;
    let total = evaluation.filters_total;
    let passed_names = evaluation.passed_rule_names();

    let main = if total > 0 && evaluation.filters_passed == total {
        format!(
            "Main Reasoning: Selected '{name}' (Rank #{}) because it passed all {total} filters: {}. \
             Ranking score: {:.2} based on {criteria}.",
            top.rank,
            passed_names.join(", "),
            top.composite_score
        )
    } else if total > 0 {
        let passed_list = if passed_names.is_empty() {
            "none".to_string()
        } else {
            passed_names.join(", ")
        };
        format!(
            "Main Reasoning: Selected '{name}' (Rank #{}) because it passed the most filters \
             ({}/{total}: {passed_list}). Ranking score: {:.2} based on {criteria}.",
            top.rank, evaluation.filters_passed, top.composite_score
        )
    } else {
        format!(
            "Main Reasoning: Selected '{name}' (Rank #{}) with ranking score {:.2} based on {criteria}.",
            top.rank, top.composite_score
        )
    };

    let mut lines = vec![main, String::new(), "Ranking Details:".to_string()];
    for candidate in outcome.candidates.iter().take(LEADERBOARD_LIMIT) {
        lines.push(format!(
            "  {}. {} - {}/{} filters passed, criteria score: {:.2}",
            candidate.rank,
            candidate.evaluation.entity_name,
            candidate.evaluation.filters_passed,
            candidate.evaluation.filters_total,
            candidate.composite_score
        ));
    }

    lines.push(String::new());
    lines.push("Final Recommendation:".to_string());
    lines.push(format!("  Selected: {name}"));
    if let Some(selection) = &outcome.selection {
        lines.push(format!("  Reasoning: Ranked #{} - {}", selection.rank, selection.reason));
    }
    lines.push(format!("  Ranking Score: {:.2}", top.composite_score));
    lines.join("\n")
}

/// One-line summary of a generic step built from well-known input/output keys.
#[must_use]
pub fn step_reasoning(step_name: &str, input: &Value, output: &Value) -> String {
    let mut parts = vec![format!("Executed step: {step_name}")];
    if let Some(summary) = summarize_counts(input) {
        parts.push(format!("Input: {summary}"));
    }
    if let Some(summary) = summarize_counts(output) {
        parts.push(format!("Output: {summary}"));
    }
    parts.join(" | ")
}

fn summarize_counts(data: &Value) -> Option<String> {
    let mut summary = Vec::new();
    for (key, noun) in [
        ("candidates_count", "candidates"),
        ("total_evaluated", "evaluated"),
        ("passed", "passed"),
        ("failed", "failed"),
    ] {
        if let Some(count) = data.get(key) {
            summary.push(format!("{} {noun}", render(count)));
        }
    }
    if let Some(selected) = data.get("selected_item").filter(|item| !item.is_null()) {
        let label = selected
            .get("name")
            .filter(|name| !name.is_null())
            .or_else(|| selected.get("id"))
            .unwrap_or(selected);
        summary.push(format!("selected {}", render(label)));
    }
    (!summary.is_empty()).then(|| summary.join(", "))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use decision_trace_domain::{Comparator, Entity, RankingCriteria, RuleKind, Scalar};
    use decision_trace_rules::{apply_filters, rank, RuleSet};
    use serde_json::json;

    fn rule(name: &str, field: &str, comparator: Comparator, value: i64) -> Rule {
        Rule {
            step: "screen".to_string(),
            kind: RuleKind::Filter,
            name: name.to_string(),
            field: field.to_string(),
            comparator,
            value: Some(Scalar::Int(value)),
            min: None,
            max: None,
            primary: None,
            secondary: None,
            tertiary: None,
            description: String::new(),
        }
    }

    fn catalog(size: usize) -> Vec<Entity> {
        (0..size)
            .map(|index| {
                let index = i64::try_from(index).unwrap_or(i64::MAX);
                Entity::new()
                    .with("id", format!("p{index}"))
                    .with("name", format!("Product {index:02}"))
                    .with("rating", index % 5)
                    .with("count", index * 10)
            })
            .collect()
    }

    fn rule_set() -> RuleSet {
        let mut good = rule("good", "rating", Comparator::Min, 3);
        good.description = "Well reviewed".to_string();
        RuleSet::from_rules(vec![good, rule("popular", "count", Comparator::Min, 20)])
    }

    #[test]
    fn describe_rule_includes_condition_and_description() {
        let rules = rule_set();
        assert_eq!(describe_rule(&rules.rules()[0]), "good (rating: ≥3) - Well reviewed");
        assert_eq!(describe_rule(&rules.rules()[1]), "popular (count: ≥20)");
    }

    #[test]
    fn filter_reasoning_without_filters_is_vacuous() {
        let text = filter_reasoning(&[], &[], Some("screen"));
        assert_eq!(text, "No filters defined for step 'screen'. All 0 items passed.");
    }

    #[test]
    fn filter_reasoning_lists_rules_summary_and_tree() {
        let rules = rule_set();
        let outcome = apply_filters(&catalog(4), &rules, Some("screen"));
        let text = filter_reasoning(&outcome.evaluations, &rules.filters(Some("screen")), Some("screen"));

        assert!(text.starts_with(
            "Main Reasoning: 1 candidate(s) passed all 2 filter(s): good, popular. Top candidate: Product 03."
        ));
        assert!(text.contains("Filters Applied (2 total):\n  • good (rating: ≥3) - Well reviewed\n  • popular (count: ≥20)"));
        assert!(text.contains("Summary: 1 out of 4 candidates passed all 2 filter(s), 3 failed"));
        assert!(text.contains(
            "  ├── ✓ Product 03 - PASSED all 2 filters - rating >= 3 (actual: 3), count >= 20 (actual: 30)"
        ));
        assert!(text.contains("  ├── ✗ Product 00 - FAILED: rating >= 3 (actual: 0), count >= 20 (actual: 0)"));
        assert!(text.ends_with("  └── ✗ Product 01 - FAILED: rating >= 3 (actual: 1), count >= 20 (actual: 10)"));
    }

    #[test]
    fn filter_reasoning_truncates_long_breakdowns() {
        let rules = rule_set();
        let outcome = apply_filters(&catalog(14), &rules, Some("screen"));
        let text = filter_reasoning(&outcome.evaluations, &rules.filters(Some("screen")), Some("screen"));
        let tree_lines = text
            .lines()
            .filter(|line| line.starts_with("  ├──") || line.starts_with("  └──"))
            .count();
        assert_eq!(tree_lines, BREAKDOWN_LIMIT + 1);
        assert!(text.ends_with("  └── ... (4 more: 0 passed, 4 failed)"));
    }

    #[test]
    fn filter_reasoning_is_deterministic() {
        let rules = rule_set();
        let outcome = apply_filters(&catalog(9), &rules, Some("screen"));
        let filters = rules.filters(Some("screen"));
        assert_eq!(
            filter_reasoning(&outcome.evaluations, &filters, None),
            filter_reasoning(&outcome.evaluations, &filters, None)
        );
    }

    #[test]
    fn filter_reasoning_reports_partial_best() {
        let rules = RuleSet::from_rules(vec![
            rule("good", "rating", Comparator::Min, 3),
            rule("impossible", "count", Comparator::Min, 10_000),
        ]);
        let outcome = apply_filters(&catalog(5), &rules, None);
        let text = filter_reasoning(&outcome.evaluations, &rules.filters(None), None);
        assert!(text.starts_with(
            "Main Reasoning: No candidates passed all 2 filter(s): good, impossible. Top candidate passed 1/2 filters: Product 03."
        ));
    }

    #[test]
    fn ranking_reasoning_explains_the_winner() {
        let rules = rule_set();
        let outcome = apply_filters(&catalog(4), &rules, Some("screen"));
        let ranked = rank(&outcome.evaluations, &RankingCriteria::fallback());
        let text = ranking_reasoning(&ranked);

        assert!(text.starts_with(
            "Main Reasoning: Selected 'Product 03' (Rank #1) because it passed all 2 filters: good, popular. \
             Ranking score: 0.50 based on primary: count, secondary: score."
        ));
        assert!(text.contains("Ranking Details:\n  1. Product 03 - 2/2 filters passed, criteria score: 0.50"));
        assert!(text.contains("  Selected: Product 03"));
        assert!(text.contains("  Reasoning: Ranked #1 - Passed all 2 filters - highest count (30)"));
        assert!(text.ends_with("  Ranking Score: 0.50"));
    }

    #[test]
    fn ranking_reasoning_handles_no_candidates() {
        let ranked = rank(&[], &RankingCriteria::fallback());
        assert_eq!(ranking_reasoning(&ranked), "No candidates available for ranking.");
    }

    #[test]
    fn step_reasoning_uses_known_keys() {
        let text = step_reasoning(
            "select",
            &json!({"candidates_count": 12}),
            &json!({"total_evaluated": 12, "passed": 4, "failed": 8, "selected_item": {"name": "Kettle"}}),
        );
        assert_eq!(
            text,
            "Executed step: select | Input: 12 candidates | Output: 12 evaluated, 4 passed, 8 failed, selected Kettle"
        );
        assert_eq!(step_reasoning("noop", &json!({}), &json!({})), "Executed step: noop");
    }

    #[test]
    fn step_reasoning_summarizes_both_sides_and_skips_empty_selection() {
        let text = step_reasoning(
            "rank_candidates",
            &json!({"candidates_count": 3, "passed": 2}),
            &json!({"ranked_count": 0, "selected_item": null}),
        );
        assert_eq!(
            text,
            "Executed step: rank_candidates | Input: 3 candidates, 2 passed"
        );
        assert!(!text.contains("null"));

        let by_id = step_reasoning("pick", &json!({}), &json!({"selected_item": {"id": "p7"}}));
        assert_eq!(by_id, "Executed step: pick | Output: selected p7");
    }
}
