//! Property-based tests for the value total order and sort stability.

use proptest::prelude::*;

use memdoc::{Document, Pipeline, Value};

// ============================================================================
// Test Strategies
// ============================================================================

fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Boolean),
        (-1_000_000i64..1_000_000).prop_map(Value::Integer),
        (-1.0e6f64..1.0e6).prop_map(Value::Float),
        wide_number_strategy(),
        "[a-z]{0,6}".prop_map(Value::String),
    ]
}

/// Numbers where `i64` to `f64` conversion rounds: around ±2^53 and out to
/// the ends of the `i64` range, as integers and as floats.
fn wide_number_strategy() -> impl Strategy<Value = Value> {
    const TWO_53: i64 = 1 << 53;
    prop_oneof![
        (TWO_53 - 4..TWO_53 + 4).prop_map(Value::Integer),
        (-TWO_53 - 4..-TWO_53 + 4).prop_map(Value::Integer),
        (TWO_53 - 4..TWO_53 + 4).prop_map(|i| Value::Float(i as f64)),
        (-TWO_53 - 4..-TWO_53 + 4).prop_map(|i| Value::Float(i as f64 + 0.5)),
        any::<i64>().prop_map(Value::Integer),
        prop_oneof![Just(i64::MAX), Just(i64::MIN), Just(i64::MAX - 1)].prop_map(Value::Integer),
        prop_oneof![
            Just(9_223_372_036_854_775_808.0),
            Just(-9_223_372_036_854_775_808.0),
            Just(9_223_372_036_854_774_784.0),
        ]
        .prop_map(Value::Float),
        (-1.0e19f64..1.0e19).prop_map(Value::Float),
    ]
}

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        4 => scalar_strategy(),
        1 => prop::collection::vec(scalar_strategy(), 0..4).prop_map(Value::Array),
        1 => prop::collection::vec(("[a-c]", scalar_strategy()), 0..3)
            .prop_map(|fields| Value::Document(fields.into_iter().collect())),
    ]
}

fn no_lookup(_: &str, _: &memdoc::Filter) -> memdoc::Result<Vec<Document>> {
    Ok(Vec::new())
}

// ============================================================================
// Ordering Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_compare_is_antisymmetric(a in value_strategy(), b in value_strategy()) {
        prop_assert_eq!(a.compare(&b), b.compare(&a).reverse());
    }

    #[test]
    fn prop_compare_is_transitive(
        a in value_strategy(),
        b in value_strategy(),
        c in value_strategy(),
    ) {
        let mut sorted = [a, b, c];
        sorted.sort();
        prop_assert!(sorted[0] <= sorted[1]);
        prop_assert!(sorted[1] <= sorted[2]);
        prop_assert!(sorted[0] <= sorted[2]);
    }

    /// Integer/float comparison agrees with exact arithmetic on integral
    /// floats, so no two distinct integers share an equal float.
    #[test]
    fn prop_wide_numbers_are_transitive(
        a in wide_number_strategy(),
        b in wide_number_strategy(),
        c in wide_number_strategy(),
    ) {
        if a <= b && b <= c {
            prop_assert!(a <= c);
        }
        if a == b && b == c {
            prop_assert_eq!(a.compare(&c), std::cmp::Ordering::Equal);
        }
        prop_assert_eq!(a.compare(&b), b.compare(&a).reverse());
    }

    #[test]
    fn prop_integer_matches_float_only_when_exact(i in any::<i64>()) {
        let f = i as f64;
        let exact = f < 9_223_372_036_854_775_808.0 && f as i64 == i;
        prop_assert_eq!(Value::Integer(i) == Value::Float(f), exact);
    }

    #[test]
    fn prop_equal_values_compare_equal_to_clones(a in value_strategy()) {
        prop_assert_eq!(a.compare(&a.clone()), std::cmp::Ordering::Equal);
    }

    /// Documents sharing a sort key keep their input order after `$sort`.
    #[test]
    fn prop_sort_stage_is_stable(keys in prop::collection::vec(0i64..4, 0..40)) {
        let docs: Vec<Document> = keys
            .iter()
            .enumerate()
            .map(|(seq, key)| {
                let mut doc = Document::new();
                doc.insert("key", *key);
                doc.insert("seq", seq as i64);
                doc
            })
            .collect();

        let mut stage = Document::new();
        let mut spec = Document::new();
        spec.insert("key", 1);
        stage.insert("$sort", spec);
        let pipeline = Pipeline::parse(&[stage]).unwrap();
        let out = pipeline.execute(docs, &no_lookup).unwrap();

        prop_assert_eq!(out.len(), keys.len());
        for pair in out.windows(2) {
            let (k0, k1) = (pair[0].get("key").unwrap(), pair[1].get("key").unwrap());
            prop_assert!(k0 <= k1);
            if k0 == k1 {
                prop_assert!(pair[0].get("seq").unwrap() < pair[1].get("seq").unwrap());
            }
        }
    }
}
