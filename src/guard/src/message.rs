//! Operator-facing explanations for blocked deletions.

use common::model::ContextEntityType;

use crate::probe::UsageResult;

/// Identifiers are listed only when a kind has at most this many references.
const MAX_LISTED: u64 = 3;

/// Why `(entity_type, display)` cannot be deleted, or `None` when it is not in use.
///
/// An unverifiable probe yields a transient "service unavailable" message that never
/// reads like a confirmed reference.
pub fn usage_message(
    entity_type: ContextEntityType,
    display: &str,
    usage: &UsageResult,
) -> Option<String> {
    if !usage.blocks_deletion() {
        return None;
    }

    if usage.verification_failed {
        return Some(format!(
            "cannot verify whether {entity_type} '{display}' is still referenced: \
             peer service unavailable, try again later"
        ));
    }

    let parts: Vec<String> = usage
        .reference_counts
        .iter()
        .map(|(kind, count)| {
            let identifiers = usage
                .referenced_by
                .get(kind)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let noun = kind.noun(*count);
            if *count <= MAX_LISTED && identifiers.len() as u64 == *count {
                format!("{count} {noun} ({})", identifiers.join(", "))
            } else {
                format!("{count} {noun}")
            }
        })
        .collect();

    if parts.is_empty() {
        return Some(format!(
            "{entity_type} '{display}' is currently referenced by other records"
        ));
    }

    Some(format!(
        "{entity_type} '{display}' is currently referenced by {}",
        join_human(&parts)
    ))
}

/// "a", "a and b", "a, b and c".
fn join_human(parts: &[String]) -> String {
    match parts {
        [] => String::new(),
        [only] => only.clone(),
        [head @ .., last] => format!("{} and {last}", head.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ReferenceKind;
    use std::collections::BTreeMap;

    fn referenced(entries: &[(ReferenceKind, u64, &[&str])]) -> UsageResult {
        let mut usage = UsageResult {
            in_use: true,
            ..UsageResult::default()
        };
        for (kind, count, ids) in entries {
            usage.reference_counts.insert(*kind, *count);
            if !ids.is_empty() {
                usage
                    .referenced_by
                    .insert(*kind, ids.iter().map(|s| s.to_string()).collect());
            }
        }
        usage
    }

    #[test]
    fn test_unused_has_no_message() {
        assert_eq!(
            usage_message(ContextEntityType::Category, "Laptops", &UsageResult::unused()),
            None
        );
    }

    #[test]
    fn test_few_references_are_listed() {
        let usage = referenced(&[
            (ReferenceKind::Asset, 2, &["AST-1", "AST-2"][..]),
            (ReferenceKind::Component, 1, &["CMP-9"][..]),
        ]);
        assert_eq!(
            usage_message(ContextEntityType::Category, "Laptops", &usage).unwrap(),
            "category 'Laptops' is currently referenced by 2 assets (AST-1, AST-2) and 1 component (CMP-9)"
        );
    }

    #[test]
    fn test_many_references_show_only_a_count() {
        let usage = referenced(&[(ReferenceKind::Asset, 120, &["1", "2", "3", "4", "5"][..])]);
        let message = usage_message(ContextEntityType::Location, "Berlin", &usage).unwrap();
        assert_eq!(
            message,
            "location 'Berlin' is currently referenced by 120 assets"
        );
        assert!(!message.contains("AST"));
    }

    #[test]
    fn test_count_without_identifiers() {
        let usage = referenced(&[(ReferenceKind::Repair, 2, &[][..])]);
        assert_eq!(
            usage_message(ContextEntityType::Supplier, "Acme", &usage).unwrap(),
            "supplier 'Acme' is currently referenced by 2 repairs"
        );
    }

    #[test]
    fn test_opaque_reference() {
        let usage = UsageResult {
            in_use: true,
            referenced_by: BTreeMap::new(),
            reference_counts: BTreeMap::new(),
            verification_failed: false,
        };
        assert_eq!(
            usage_message(ContextEntityType::Supplier, "Acme", &usage).unwrap(),
            "supplier 'Acme' is currently referenced by other records"
        );
    }

    #[test]
    fn test_unverified_is_distinct_from_referenced() {
        let message =
            usage_message(ContextEntityType::Supplier, "Acme", &UsageResult::unverified()).unwrap();
        assert!(message.contains("peer service unavailable"));
        assert!(!message.contains("currently referenced"));
    }

    #[test]
    fn test_unverified_without_in_use_still_blocks() {
        let usage = UsageResult {
            in_use: false,
            verification_failed: true,
            ..UsageResult::default()
        };
        let message = usage_message(ContextEntityType::Category, "Laptops", &usage).unwrap();
        assert!(message.contains("peer service unavailable"));
    }

    #[test]
    fn test_join_human() {
        let parts = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(join_human(&parts(&[])), "");
        assert_eq!(join_human(&parts(&["a"])), "a");
        assert_eq!(join_human(&parts(&["a", "b"])), "a and b");
        assert_eq!(join_human(&parts(&["a", "b", "c"])), "a, b and c");
    }
}
