//! Property-based tests for version ordering and predicate matching.

#[cfg(test)]
mod proptest_tests {
    use crate::version::{compare_versions, select, VersionPredicate};
    use proptest::prelude::*;
    use std::cmp::Ordering;

    fn version() -> impl Strategy<Value = String> {
        prop::collection::vec(0u32..50, 1..4).prop_map(|parts| {
            parts
                .iter()
                .map(|part| part.to_string())
                .collect::<Vec<_>>()
                .join(".")
        })
    }

    proptest! {
        /// Property: comparison is reflexive
        #[test]
        fn compare_is_reflexive(a in version()) {
            prop_assert_eq!(compare_versions(&a, &a), Ordering::Equal);
        }

        /// Property: comparison is antisymmetric
        #[test]
        fn compare_is_antisymmetric(a in version(), b in version()) {
            prop_assert_eq!(compare_versions(&a, &b), compare_versions(&b, &a).reverse());
        }

        /// Property: an exact predicate matches exactly its own version
        #[test]
        fn exact_predicate_matches_itself(a in version(), b in version()) {
            let predicate = VersionPredicate::parse(&a).unwrap();
            prop_assert!(predicate.matches(&a));
            prop_assert_eq!(predicate.matches(&b), compare_versions(&a, &b) == Ordering::Equal);
        }

        /// Property: `*` selects the highest installed version
        #[test]
        fn wildcard_selects_highest(installed in prop::collection::vec(version(), 1..8)) {
            let selected = select("dep", "*", &installed).unwrap();
            for other in &installed {
                prop_assert_ne!(compare_versions(other, &selected), Ordering::Greater);
            }
        }

        /// Property: a selected version always satisfies its predicate
        #[test]
        fn selection_satisfies_predicate(
            installed in prop::collection::vec(version(), 1..8),
            floor in version(),
        ) {
            let predicate = format!(">={}", floor);
            if let Ok(selected) = select("dep", &predicate, &installed) {
                prop_assert!(VersionPredicate::parse(&predicate).unwrap().matches(&selected));
            }
        }
    }
}
