//! Hint generation from partial-evaluation fail events
//!
//! When the known part of a query dies on an undefined `input.…` reference
//! whose first path component is a near-miss of a declared unknown, the
//! response carries a "did you mean" hint.

use std::collections::BTreeSet;

use crate::policy::ast::RefBase;
use crate::policy::partial::FailEvent;

/// Maximum edit distance for a first-component near-miss.
const MAX_DISTANCE: usize = 2;

/// Build deduplicated hints from fail events and the declared unknowns.
#[must_use]
pub fn from_fails(fails: &[FailEvent], unknowns: &[(RefBase, Vec<String>)]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut hints = Vec::new();

    for fail in fails {
        let Some(rest) = fail.reference.strip_prefix("input.") else {
            continue;
        };
        let mut components = rest.split('.');
        let Some(first) = components.next() else {
            continue;
        };
        let tail: Vec<&str> = components.collect();

        for (base, path) in unknowns {
            if *base != RefBase::Input {
                continue;
            }
            let Some(candidate) = path.first() else {
                continue;
            };
            let distance = edit_distance(first, candidate);
            if distance == 0 || distance > MAX_DISTANCE {
                continue;
            }
            let mut suggestion = vec!["input", candidate.as_str()];
            suggestion.extend(&tail);
            let message = format!(
                "{} undefined, did you mean {}?",
                fail.reference,
                suggestion.join(".")
            );
            if seen.insert(message.clone()) {
                hints.push(message);
            }
        }
    }
    hints
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ast::Location;

    fn fail(reference: &str) -> FailEvent {
        FailEvent {
            reference: reference.to_string(),
            location: Location::synthetic(),
        }
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("fruit", "fruits"), 1);
        assert_eq!(edit_distance("fruit", "fruit"), 0);
        assert_eq!(edit_distance("abc", "xyz"), 3);
    }

    #[test]
    fn test_near_miss_produces_hint() {
        let unknowns = vec![(RefBase::Input, vec!["fruits".to_string()])];
        let hints = from_fails(&[fail("input.fruit.colour")], &unknowns);
        assert_eq!(
            hints,
            vec!["input.fruit.colour undefined, did you mean input.fruits.colour?".to_string()]
        );
    }

    #[test]
    fn test_exact_match_and_distant_names_skipped() {
        let unknowns = vec![(RefBase::Input, vec!["fruits".to_string()])];
        assert!(from_fails(&[fail("input.fruits.colour")], &unknowns).is_empty());
        assert!(from_fails(&[fail("input.vegetables.colour")], &unknowns).is_empty());
    }

    #[test]
    fn test_hints_deduplicate() {
        let unknowns = vec![(RefBase::Input, vec!["fruits".to_string()])];
        let fails = vec![fail("input.fruit.colour"), fail("input.fruit.colour")];
        assert_eq!(from_fails(&fails, &unknowns).len(), 1);
    }
}
