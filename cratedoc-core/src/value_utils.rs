//! Value utility functions shared across modules
//!
//! This module provides common functions for working with JSON values,
//! namely the ordering rules the query and sort engines compare documents
//! by. Dotted-path field access lives on [`crate::document::Document::get`]
//! directly rather than as a second, standalone accessor here.

use serde_json::Value;
use std::cmp::Ordering;

/// Compare two JSON values
///
/// Returns `Some(Ordering)` for comparable types (numbers, strings, booleans),
/// `None` for incompatible types (e.g., comparing string to number).
///
/// # Supported comparisons
///
/// - Number vs Number (uses f64 comparison)
/// - String vs String (lexicographic)
/// - Bool vs Bool (false < true)
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use std::cmp::Ordering;
/// use cratedoc_core::value_utils::compare_values;
///
/// assert_eq!(compare_values(&json!(10), &json!(5)), Some(Ordering::Greater));
/// assert_eq!(compare_values(&json!("a"), &json!("b")), Some(Ordering::Less));
/// assert_eq!(compare_values(&json!("a"), &json!(1)), None); // incompatible
/// ```
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        // null sorts below any non-null value (spec: "null is less than any non-null").
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        (Value::Number(n1), Value::Number(n2)) => {
            let f1 = n1.as_f64()?;
            let f2 = n2.as_f64()?;
            f1.partial_cmp(&f2)
        }
        (Value::String(s1), Value::String(s2)) => Some(s1.cmp(s2)),
        (Value::Bool(b1), Value::Bool(b2)) => Some(b1.cmp(b2)),
        _ => None,
    }
}

/// Compare two optional JSON values with None handling
///
/// Used for sorting where missing values need consistent ordering.
/// None values are considered "less than" any actual value.
///
/// # Ordering rules
///
/// - None < Some(_)
/// - Some(a) vs Some(b) uses compare_values
/// - Incompatible types return Equal (stable sort behavior)
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use std::cmp::Ordering;
/// use cratedoc_core::value_utils::compare_values_with_none;
///
/// assert_eq!(compare_values_with_none(None, Some(&json!(5))), Ordering::Less);
/// assert_eq!(compare_values_with_none(Some(&json!(10)), None), Ordering::Greater);
/// ```
pub fn compare_values_with_none(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(av), Some(bv)) => compare_values(av, bv).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compare_values_numbers() {
        assert_eq!(
            compare_values(&json!(10), &json!(5)),
            Some(Ordering::Greater)
        );
        assert_eq!(compare_values(&json!(5), &json!(10)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!(5), &json!(5)), Some(Ordering::Equal));
        assert_eq!(
            compare_values(&json!(3.5), &json!(2.5)),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_compare_values_strings() {
        assert_eq!(
            compare_values(&json!("banana"), &json!("apple")),
            Some(Ordering::Greater)
        );
        assert_eq!(
            compare_values(&json!("apple"), &json!("banana")),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_values(&json!("apple"), &json!("apple")),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_compare_values_booleans() {
        assert_eq!(
            compare_values(&json!(true), &json!(false)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            compare_values(&json!(false), &json!(true)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_compare_values_null_is_less_than_non_null() {
        assert_eq!(compare_values(&Value::Null, &json!(0)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("a"), &Value::Null), Some(Ordering::Greater));
        assert_eq!(compare_values(&Value::Null, &Value::Null), Some(Ordering::Equal));
    }

    #[test]
    fn test_compare_values_incompatible() {
        assert_eq!(compare_values(&json!("string"), &json!(42)), None);
        assert_eq!(compare_values(&json!(true), &json!(1)), None);
        assert_eq!(compare_values(&json!([1, 2]), &json!(1)), None);
    }

    #[test]
    fn test_compare_values_with_none() {
        assert_eq!(compare_values_with_none(None, None), Ordering::Equal);
        assert_eq!(
            compare_values_with_none(None, Some(&json!(5))),
            Ordering::Less
        );
        assert_eq!(
            compare_values_with_none(Some(&json!(5)), None),
            Ordering::Greater
        );
        assert_eq!(
            compare_values_with_none(Some(&json!(10)), Some(&json!(5))),
            Ordering::Greater
        );
        // Incompatible types return Equal
        assert_eq!(
            compare_values_with_none(Some(&json!("a")), Some(&json!(1))),
            Ordering::Equal
        );
    }
}
