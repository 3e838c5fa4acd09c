// src/query/operators.rs
//! Query operator implementations: a Strategy-pattern registry
//! mapping operator name to an `OperatorMatcher`. Each operator is a small,
//! independently testable type; `matches_filter` is the sole entry point a
//! collection or the query engine calls.

use crate::document::Document;
use crate::error::{Error, Result};
use crate::value_utils::compare_values;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

// ============================================================================
// REGEX CACHING
// ============================================================================

lazy_static! {
    /// Compiled-pattern cache keyed by "pattern:options". Unbounded - the
    /// pattern space in a selector comes from application code, not
    /// untrusted input, so there's no eviction pressure worth the
    /// complexity of an LRU here.
    static ref REGEX_CACHE: Mutex<HashMap<String, Regex>> = Mutex::new(HashMap::new());
}

/// Convert Mango-style options (i, m, s, x) to Rust regex inline flags.
fn build_regex_pattern(pattern: &str, options: &str) -> String {
    let valid_options: String = options
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();

    if valid_options.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{valid_options}){pattern}")
    }
}

/// Returns `None` for a pattern that fails to compile - callers treat that
/// as "doesn't match" rather than a query error, so an invalid pattern
/// yields `false` instead of aborting the query.
fn get_or_compile_regex(pattern: &str, options: &str) -> Option<Regex> {
    let cache_key = format!("{pattern}:{options}");

    if let Some(regex) = REGEX_CACHE.lock().unwrap().get(&cache_key) {
        return Some(regex.clone());
    }

    let regex_pattern = build_regex_pattern(pattern, options);
    let regex = Regex::new(&regex_pattern).ok()?;

    REGEX_CACHE.lock().unwrap().insert(cache_key, regex.clone());
    Some(regex)
}

fn regex_match_with_options(text: &str, pattern: &str, options: &str) -> Result<bool> {
    Ok(get_or_compile_regex(pattern, options).is_some_and(|re| re.is_match(text)))
}

// ============================================================================
// TRAIT DEFINITION
// ============================================================================

/// A single selector operator (`$eq`, `$gt`, `$and`, ...).
pub trait OperatorMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// - `doc_value`: the field's current value, `None` if absent.
    /// - `filter_value`: the operator's operand from the selector.
    /// - `document`: the whole document, needed by operators (`$and`/`$or`/
    ///   `$nor`/`$not`) that recurse back into `matches_filter`.
    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&Document>,
    ) -> Result<bool>;
}

// ============================================================================
// COMPARISON OPERATORS
// ============================================================================

pub struct EqOperator;

impl OperatorMatcher for EqOperator {
    fn name(&self) -> &'static str {
        "$eq"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        match doc_value {
            None => Ok(false),
            Some(v) => {
                if v == filter_value {
                    return Ok(true);
                }
                if let Value::Array(arr) = v {
                    Ok(arr.iter().any(|elem| elem == filter_value))
                } else {
                    Ok(false)
                }
            }
        }
    }
}

pub struct NeOperator;

impl OperatorMatcher for NeOperator {
    fn name(&self) -> &'static str {
        "$ne"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        match doc_value {
            None => Ok(true),
            Some(v) => {
                if v == filter_value {
                    return Ok(false);
                }
                if let Value::Array(arr) = v {
                    Ok(!arr.iter().any(|elem| elem == filter_value))
                } else {
                    Ok(true)
                }
            }
        }
    }
}

pub struct GtOperator;

impl OperatorMatcher for GtOperator {
    fn name(&self) -> &'static str {
        "$gt"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        compare_with_predicate(doc_value, filter_value, |ord| ord == std::cmp::Ordering::Greater)
    }
}

pub struct GteOperator;

impl OperatorMatcher for GteOperator {
    fn name(&self) -> &'static str {
        "$gte"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        compare_with_predicate(doc_value, filter_value, |ord| {
            matches!(ord, std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        })
    }
}

pub struct LtOperator;

impl OperatorMatcher for LtOperator {
    fn name(&self) -> &'static str {
        "$lt"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        compare_with_predicate(doc_value, filter_value, |ord| ord == std::cmp::Ordering::Less)
    }
}

pub struct LteOperator;

impl OperatorMatcher for LteOperator {
    fn name(&self) -> &'static str {
        "$lte"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        compare_with_predicate(doc_value, filter_value, |ord| {
            matches!(ord, std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        })
    }
}

/// `$mod`: `{ field: { $mod: [divisor, remainder] } }`.
pub struct ModOperator;

impl OperatorMatcher for ModOperator {
    fn name(&self) -> &'static str {
        "$mod"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        let Some(n) = doc_value.and_then(Value::as_i64) else {
            return Ok(false);
        };
        let Value::Array(pair) = filter_value else {
            return Err(Error::query("$mod operator requires a [divisor, remainder] array"));
        };
        let (Some(divisor), Some(remainder)) = (
            pair.first().and_then(Value::as_i64),
            pair.get(1).and_then(Value::as_i64),
        ) else {
            return Err(Error::query("$mod operator requires two integers"));
        };
        if divisor == 0 {
            return Err(Error::query("$mod divisor must not be zero"));
        }
        Ok(n % divisor == remainder)
    }
}

// ============================================================================
// ARRAY OPERATORS
// ============================================================================

pub struct InOperator;

impl OperatorMatcher for InOperator {
    fn name(&self) -> &'static str {
        "$in"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        match doc_value {
            None => Ok(false),
            Some(v) => {
                if let Value::Array(filter_arr) = filter_value {
                    if filter_arr.contains(v) {
                        return Ok(true);
                    }
                    if let Value::Array(doc_arr) = v {
                        Ok(doc_arr.iter().any(|elem| filter_arr.contains(elem)))
                    } else {
                        Ok(false)
                    }
                } else {
                    Err(Error::query("$in operator requires an array"))
                }
            }
        }
    }
}

pub struct NinOperator;

impl OperatorMatcher for NinOperator {
    fn name(&self) -> &'static str {
        "$nin"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        if let Value::Array(filter_arr) = filter_value {
            match doc_value {
                None => Ok(true),
                Some(v) => {
                    if filter_arr.contains(v) {
                        return Ok(false);
                    }
                    if let Value::Array(doc_arr) = v {
                        Ok(!doc_arr.iter().any(|elem| filter_arr.contains(elem)))
                    } else {
                        Ok(true)
                    }
                }
            }
        } else {
            Err(Error::query("$nin operator requires an array"))
        }
    }
}

// ============================================================================
// ELEMENT OPERATORS
// ============================================================================

pub struct ExistsOperator;

impl OperatorMatcher for ExistsOperator {
    fn name(&self) -> &'static str {
        "$exists"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        if let Value::Bool(should_exist) = filter_value {
            Ok(doc_value.is_some() == *should_exist)
        } else {
            Err(Error::query("$exists operator requires a boolean"))
        }
    }
}

pub struct AllOperator;

impl OperatorMatcher for AllOperator {
    fn name(&self) -> &'static str {
        "$all"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        match doc_value {
            None => Ok(false),
            Some(Value::Array(doc_arr)) => {
                if let Value::Array(required) = filter_value {
                    Ok(required.iter().all(|req| doc_arr.contains(req)))
                } else {
                    Err(Error::query("$all operator requires an array"))
                }
            }
            Some(_) => Ok(false),
        }
    }
}

pub struct ElemMatchOperator;

impl OperatorMatcher for ElemMatchOperator {
    fn name(&self) -> &'static str {
        "$elemMatch"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        match doc_value {
            None => Ok(false),
            Some(Value::Array(arr)) => {
                for elem in arr {
                    let Value::Object(obj) = elem else { continue };
                    let mut matches_all = true;

                    if let Value::Object(conditions) = filter_value {
                        for (key, value) in conditions {
                            let field_value = obj.get(key);

                            if let Value::Object(op_obj) = value {
                                for (op_name, op_value) in op_obj {
                                    if op_name.starts_with('$') {
                                        if let Some(operator) = OPERATOR_REGISTRY.get(op_name.as_str()) {
                                            if !operator.matches(field_value, op_value, None)? {
                                                matches_all = false;
                                                break;
                                            }
                                        }
                                    }
                                }
                            } else if field_value != Some(value) {
                                matches_all = false;
                                break;
                            }
                        }
                    }

                    if matches_all {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Some(_) => Ok(false),
        }
    }
}

pub struct SizeOperator;

impl OperatorMatcher for SizeOperator {
    fn name(&self) -> &'static str {
        "$size"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        match doc_value {
            None => Ok(false),
            Some(Value::Array(arr)) => {
                if let Some(size) = filter_value.as_i64() {
                    Ok(arr.len() as i64 == size)
                } else if let Some(size) = filter_value.as_u64() {
                    Ok(arr.len() as u64 == size)
                } else {
                    Err(Error::query("$size operator requires an integer"))
                }
            }
            Some(_) => Ok(false),
        }
    }
}

pub struct RegexOperator;

impl OperatorMatcher for RegexOperator {
    fn name(&self) -> &'static str {
        "$regex"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        match doc_value {
            None => Ok(false),
            Some(Value::String(s)) => {
                if let Value::String(pattern) = filter_value {
                    regex_match_with_options(s, pattern, "")
                } else {
                    Err(Error::query("$regex operator requires a string pattern"))
                }
            }
            Some(Value::Array(arr)) => {
                if let Value::String(pattern) = filter_value {
                    for elem in arr {
                        if let Value::String(s) = elem {
                            if regex_match_with_options(s, pattern, "")? {
                                return Ok(true);
                            }
                        }
                    }
                    Ok(false)
                } else {
                    Err(Error::query("$regex operator requires a string pattern"))
                }
            }
            Some(_) => Ok(false),
        }
    }
}

pub struct TypeOperator;

impl OperatorMatcher for TypeOperator {
    fn name(&self) -> &'static str {
        "$type"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _document: Option<&Document>) -> Result<bool> {
        match doc_value {
            None => Ok(false),
            Some(val) => {
                let type_name = if let Value::String(s) = filter_value {
                    s.as_str()
                } else if let Value::Number(n) = filter_value {
                    match n.as_i64() {
                        Some(1) => "double",
                        Some(2) => "string",
                        Some(3) => "object",
                        Some(4) => "array",
                        Some(8) => "bool",
                        Some(10) => "null",
                        Some(16) => "int",
                        Some(18) => "long",
                        _ => return Err(Error::query(format!("unknown BSON type number: {n}"))),
                    }
                } else {
                    return Err(Error::query("$type operator requires a string or number"));
                };

                let matches = match type_name {
                    "double" | "number" => val.is_number(),
                    "string" => val.is_string(),
                    "object" => val.is_object(),
                    "array" => val.is_array(),
                    "bool" | "boolean" => val.is_boolean(),
                    "null" => val.is_null(),
                    "int" | "long" => val.is_i64() || val.is_u64(),
                    _ => return Err(Error::query(format!("unknown type name: {type_name}"))),
                };

                Ok(matches)
            }
        }
    }
}

// ============================================================================
// LOGICAL OPERATORS
// ============================================================================

pub struct AndOperator;

impl OperatorMatcher for AndOperator {
    fn name(&self) -> &'static str {
        "$and"
    }

    fn matches(&self, _doc_value: Option<&Value>, filter_value: &Value, document: Option<&Document>) -> Result<bool> {
        let doc = document.ok_or_else(|| Error::query("$and operator requires document context"))?;

        if let Value::Array(conditions) = filter_value {
            for condition in conditions {
                if !matches_filter(doc, condition)? {
                    return Ok(false);
                }
            }
            Ok(true)
        } else {
            Err(Error::query("$and operator requires an array"))
        }
    }
}

pub struct OrOperator;

impl OperatorMatcher for OrOperator {
    fn name(&self) -> &'static str {
        "$or"
    }

    fn matches(&self, _doc_value: Option<&Value>, filter_value: &Value, document: Option<&Document>) -> Result<bool> {
        let doc = document.ok_or_else(|| Error::query("$or operator requires document context"))?;

        if let Value::Array(conditions) = filter_value {
            for condition in conditions {
                if matches_filter(doc, condition)? {
                    return Ok(true);
                }
            }
            Ok(false)
        } else {
            Err(Error::query("$or operator requires an array"))
        }
    }
}

pub struct NorOperator;

impl OperatorMatcher for NorOperator {
    fn name(&self) -> &'static str {
        "$nor"
    }

    fn matches(&self, _doc_value: Option<&Value>, filter_value: &Value, document: Option<&Document>) -> Result<bool> {
        let doc = document.ok_or_else(|| Error::query("$nor operator requires document context"))?;

        if let Value::Array(conditions) = filter_value {
            for condition in conditions {
                if matches_filter(doc, condition)? {
                    return Ok(false);
                }
            }
            Ok(true)
        } else {
            Err(Error::query("$nor operator requires an array"))
        }
    }
}

pub struct NotOperator;

impl OperatorMatcher for NotOperator {
    fn name(&self) -> &'static str {
        "$not"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, document: Option<&Document>) -> Result<bool> {
        if document.is_some() {
            let result = matches_filter_value(doc_value, filter_value, document)?;
            Ok(!result)
        } else {
            Err(Error::query("$not operator requires document context"))
        }
    }
}

// ============================================================================
// OPERATOR REGISTRY
// ============================================================================

lazy_static! {
    /// Dynamic dispatch from operator name to implementation. Built once,
    /// immutable thereafter; every entry is `Send + Sync`.
    pub static ref OPERATOR_REGISTRY: HashMap<&'static str, Box<dyn OperatorMatcher>> = {
        let mut registry: HashMap<&'static str, Box<dyn OperatorMatcher>> = HashMap::new();

        registry.insert("$eq", Box::new(EqOperator));
        registry.insert("$ne", Box::new(NeOperator));
        registry.insert("$gt", Box::new(GtOperator));
        registry.insert("$gte", Box::new(GteOperator));
        registry.insert("$lt", Box::new(LtOperator));
        registry.insert("$lte", Box::new(LteOperator));
        registry.insert("$mod", Box::new(ModOperator));

        registry.insert("$in", Box::new(InOperator));
        registry.insert("$nin", Box::new(NinOperator));
        registry.insert("$all", Box::new(AllOperator));
        registry.insert("$elemMatch", Box::new(ElemMatchOperator));
        registry.insert("$size", Box::new(SizeOperator));

        registry.insert("$exists", Box::new(ExistsOperator));
        registry.insert("$type", Box::new(TypeOperator));

        registry.insert("$regex", Box::new(RegexOperator));

        registry.insert("$and", Box::new(AndOperator));
        registry.insert("$or", Box::new(OrOperator));
        registry.insert("$nor", Box::new(NorOperator));
        registry.insert("$not", Box::new(NotOperator));

        registry
    };
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn compare_with_predicate<F>(doc_value: Option<&Value>, filter_value: &Value, predicate: F) -> Result<bool>
where
    F: Fn(std::cmp::Ordering) -> bool,
{
    match doc_value {
        None => Ok(false),
        Some(v) => {
            if let Some(ordering) = compare_values(v, filter_value) {
                if predicate(ordering) {
                    return Ok(true);
                }
            }
            if let Value::Array(arr) = v {
                Ok(arr
                    .iter()
                    .any(|elem| compare_values(elem, filter_value).map(&predicate).unwrap_or(false)))
            } else {
                Ok(false)
            }
        }
    }
}

/// Evaluate one field's condition object against one field's value. Used by
/// `$not` to recurse without a field name in scope.
fn matches_filter_value(doc_value: Option<&Value>, filter_value: &Value, document: Option<&Document>) -> Result<bool> {
    if let Value::Object(filter_obj) = filter_value {
        for (op_name, op_value) in filter_obj {
            if op_name.starts_with('$') {
                if let Some(operator) = OPERATOR_REGISTRY.get(op_name.as_str()) {
                    if !operator.matches(doc_value, op_value, document)? {
                        return Ok(false);
                    }
                } else {
                    return Err(Error::query(format!("unknown operator: {op_name}")));
                }
            } else {
                return Err(Error::query("unexpected field in filter value"));
            }
        }
        Ok(true)
    } else {
        Ok(doc_value == Some(filter_value))
    }
}

/// Match a document against a selector (spec §4.5's Mango-subset grammar).
/// An empty selector matches everything.
pub fn matches_filter(document: &Document, filter: &Value) -> Result<bool> {
    if filter.as_object().map(|o| o.is_empty()).unwrap_or(false) {
        return Ok(true);
    }

    let filter_obj = filter.as_object().ok_or_else(|| Error::query("selector must be an object"))?;

    for (key, value) in filter_obj {
        if key.starts_with('$') {
            if let Some(operator) = OPERATOR_REGISTRY.get(key.as_str()) {
                if !operator.matches(None, value, Some(document))? {
                    return Ok(false);
                }
            } else {
                return Err(Error::query(format!("unknown operator: {key}")));
            }
            continue;
        }

        let doc_value = document.get(key);

        let Value::Object(condition_obj) = value else {
            // Direct equality, e.g. { name: "Alice" }.
            if !EqOperator.matches(doc_value, value, Some(document))? {
                return Ok(false);
            }
            continue;
        };

        // `{ field: { $regex: "...", $options: "i" } }` is evaluated as one
        // operation since `$options` only means something paired with `$regex`.
        let has_regex = condition_obj.contains_key("$regex");
        let has_options = condition_obj.contains_key("$options");

        if has_regex && has_options {
            let pattern = condition_obj
                .get("$regex")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::query("$regex requires a string pattern"))?;
            let options = condition_obj.get("$options").and_then(|v| v.as_str()).unwrap_or("");

            let matched = match doc_value {
                Some(Value::String(s)) => regex_match_with_options(s, pattern, options)?,
                Some(Value::Array(arr)) => {
                    let mut found = false;
                    for v in arr {
                        if let Value::String(s) = v {
                            if regex_match_with_options(s, pattern, options)? {
                                found = true;
                                break;
                            }
                        }
                    }
                    found
                }
                _ => false,
            };

            if !matched {
                return Ok(false);
            }

            for (op_name, op_value) in condition_obj {
                if op_name == "$regex" || op_name == "$options" {
                    continue;
                }
                if op_name.starts_with('$') {
                    if let Some(operator) = OPERATOR_REGISTRY.get(op_name.as_str()) {
                        if !operator.matches(doc_value, op_value, Some(document))? {
                            return Ok(false);
                        }
                    } else {
                        return Err(Error::query(format!("unknown operator: {op_name}")));
                    }
                }
            }
        } else {
            for (op_name, op_value) in condition_obj {
                if op_name.starts_with('$') {
                    if let Some(operator) = OPERATOR_REGISTRY.get(op_name.as_str()) {
                        if !operator.matches(doc_value, op_value, Some(document))? {
                            return Ok(false);
                        }
                    } else {
                        return Err(Error::query(format!("unknown operator: {op_name}")));
                    }
                }
            }
        }
    }

    Ok(true)
}
