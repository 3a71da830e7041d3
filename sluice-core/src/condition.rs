//! Condition evaluation
//!
//! Predicates have the shape `key=value` or `key!=value`. Both sides go through
//! variable substitution before the key is looked up in the run variables and
//! compared with the value. A key with no variable compares as the empty string.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use thiserror::Error;

use crate::domain::pipeline::Conditions;

static NOT_EQUAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^(?P<key>.*?)!=(?P<value>.*)$").expect("valid regex"));
static EQUAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^(?P<key>.*?)=(?P<value>.*)$").expect("valid regex"));
static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(?P<braced>[A-Za-z_][A-Za-z0-9_]*)\}|\$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid regex")
});

/// Condition evaluation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    /// Neither `all` nor `any` holds a predicate; callers check first
    #[error("empty condition set")]
    EmptyCondition,

    #[error("cannot parse condition: {0}")]
    MalformedCondition(String),
}

/// A parsed predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate<'a> {
    Equal { key: &'a str, value: &'a str },
    NotEqual { key: &'a str, value: &'a str },
}

impl<'a> Predicate<'a> {
    /// Parses `key!=value`, falling back to `key=value`
    ///
    /// Both halves must be non-empty.
    pub fn parse(text: &'a str) -> Result<Self, ConditionError> {
        if let Some((key, value)) = split(&NOT_EQUAL, text) {
            return Ok(Predicate::NotEqual { key, value });
        }
        if let Some((key, value)) = split(&EQUAL, text) {
            return Ok(Predicate::Equal { key, value });
        }
        Err(ConditionError::MalformedCondition(text.to_string()))
    }
}

fn split<'a>(re: &Regex, text: &'a str) -> Option<(&'a str, &'a str)> {
    let caps = re.captures(text)?;
    let key = caps.name("key")?.as_str();
    let value = caps.name("value")?.as_str();
    (!key.is_empty() && !value.is_empty()).then_some((key, value))
}

/// Evaluates `conditions` against run variables
///
/// `all` short-circuits on the first false or failing predicate; `any`
/// short-circuits on the first true one. When both lists are set only `all`
/// is consulted.
pub fn evaluate(vars: &BTreeMap<String, String>, conditions: &Conditions) -> Result<bool, ConditionError> {
    evaluate_with(conditions, |predicate| evaluate_predicate(vars, predicate))
}

/// Same ordering and precedence as [`evaluate`], with a caller-supplied predicate check
pub fn evaluate_with<F>(conditions: &Conditions, mut check: F) -> Result<bool, ConditionError>
where
    F: FnMut(&str) -> Result<bool, ConditionError>,
{
    if conditions.is_empty() {
        return Err(ConditionError::EmptyCondition);
    }

    if !conditions.all.is_empty() {
        for predicate in &conditions.all {
            if !check(predicate)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    for predicate in &conditions.any {
        if check(predicate)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Evaluates a single predicate
pub fn evaluate_predicate(vars: &BTreeMap<String, String>, text: &str) -> Result<bool, ConditionError> {
    let (key, value, negate) = match Predicate::parse(text)? {
        Predicate::Equal { key, value } => (key, value, false),
        Predicate::NotEqual { key, value } => (key, value, true),
    };
    let key = substitute_vars(vars, key);
    let value = substitute_vars(vars, value);
    let actual = vars.get(&key).map(String::as_str).unwrap_or("");
    Ok((actual == value) != negate)
}

/// Replaces `$NAME` and `${NAME}` with their values; unknown names are left as-is
pub fn substitute_vars(vars: &BTreeMap<String, String>, text: &str) -> String {
    VARIABLE
        .replace_all(text, |caps: &Captures| {
            let name = caps
                .name("braced")
                .or_else(|| caps.name("bare"))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match vars.get(name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
