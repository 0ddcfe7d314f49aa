//! Common predicates over raw JSON snapshots (the shape a kube
//! `DynamicObject` serializes to).

use serde_json::Value;

use crate::{Predicate, PredicateError};

/// `status.conditions[]` carries an entry with the given `type` and `status`.
#[derive(Debug, Clone)]
pub struct ConditionPredicate {
    type_: String,
    status: String,
    terminal_reasons: Vec<String>,
}

/// Wait until condition `type_` reports `status`.
pub fn condition(type_: impl Into<String>, status: impl Into<String>) -> ConditionPredicate {
    ConditionPredicate { type_: type_.into(), status: status.into(), terminal_reasons: Vec::new() }
}

impl ConditionPredicate {
    /// Treat the condition as unrecoverable when it reports a different status
    /// with this `reason`.
    pub fn terminal_on(mut self, reason: impl Into<String>) -> Self {
        self.terminal_reasons.push(reason.into());
        self
    }

    fn find<'a>(&self, obj: &'a Value) -> Result<Option<&'a Value>, PredicateError> {
        let conditions = match lookup(obj, "status.conditions") {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(PredicateError::new(format!("status.conditions is not a list: {}", other)))
            }
        };
        Ok(conditions
            .iter()
            .find(|c| c.get("type").and_then(Value::as_str) == Some(self.type_.as_str())))
    }
}

impl Predicate<Value> for ConditionPredicate {
    fn evaluate(&self, obj: &Value) -> Result<bool, PredicateError> {
        let Some(cond) = self.find(obj)? else { return Ok(false) };
        let status = cond.get("status").and_then(Value::as_str).unwrap_or("");
        if status == self.status {
            return Ok(true);
        }
        let reason = cond.get("reason").and_then(Value::as_str).unwrap_or("");
        if !reason.is_empty() && self.terminal_reasons.iter().any(|r| r == reason) {
            return Err(PredicateError::new(format!(
                "condition {}={} with terminal reason {}: {}",
                self.type_,
                status,
                reason,
                cond.get("message").and_then(Value::as_str).unwrap_or("")
            )));
        }
        Ok(false)
    }

    fn describe(&self) -> String {
        format!("{}={}", self.type_, self.status)
    }

    fn observe(&self, obj: &Value) -> Option<String> {
        match self.find(obj) {
            Ok(Some(cond)) => {
                let status = cond.get("status").and_then(Value::as_str).unwrap_or("Unknown");
                let reason = cond.get("reason").and_then(Value::as_str).unwrap_or("");
                let message = cond.get("message").and_then(Value::as_str).unwrap_or("");
                if reason.is_empty() && message.is_empty() {
                    Some(format!("{}={}", self.type_, status))
                } else {
                    Some(format!("{}={} ({}: {})", self.type_, status, reason, message))
                }
            }
            Ok(None) => Some(format!("condition {} absent", self.type_)),
            Err(e) => Some(e.to_string()),
        }
    }
}

/// A dotted path resolves to a non-empty string.
#[derive(Debug, Clone)]
pub struct FieldNonEmpty {
    path: String,
}

/// Wait until the string at `path` (e.g. `status.acme.uri`) is set.
pub fn field_non_empty(path: impl Into<String>) -> FieldNonEmpty {
    FieldNonEmpty { path: path.into() }
}

impl Predicate<Value> for FieldNonEmpty {
    fn evaluate(&self, obj: &Value) -> Result<bool, PredicateError> {
        match lookup(obj, &self.path) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::String(s)) => Ok(!s.is_empty()),
            Some(other) => Err(PredicateError::new(format!("{} is not a string: {}", self.path, other))),
        }
    }

    fn describe(&self) -> String {
        format!("{} set", self.path)
    }

    fn observe(&self, obj: &Value) -> Option<String> {
        let rendered = match lookup(obj, &self.path) {
            None | Some(Value::Null) => "<unset>".to_string(),
            Some(Value::String(s)) if s.is_empty() => "\"\"".to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        Some(format!("{}={}", self.path, rendered))
    }
}

/// The `data` map holds exactly `n` entries; more than `n` is a terminal mismatch.
#[derive(Debug, Clone, Copy)]
pub struct DataEntriesExactly {
    n: usize,
}

pub fn data_entries_exactly(n: usize) -> DataEntriesExactly {
    DataEntriesExactly { n }
}

impl DataEntriesExactly {
    fn count(obj: &Value) -> Result<usize, PredicateError> {
        match obj.get("data") {
            None | Some(Value::Null) => Ok(0),
            Some(Value::Object(m)) => Ok(m.len()),
            Some(other) => Err(PredicateError::new(format!("data is not a map: {}", other))),
        }
    }
}

impl Predicate<Value> for DataEntriesExactly {
    fn evaluate(&self, obj: &Value) -> Result<bool, PredicateError> {
        let have = Self::count(obj)?;
        if have > self.n {
            return Err(PredicateError::new(format!(
                "expected {} data entries, found {}",
                self.n, have
            )));
        }
        Ok(have == self.n)
    }

    fn describe(&self) -> String {
        format!("exactly {} data entries", self.n)
    }

    fn observe(&self, obj: &Value) -> Option<String> {
        Some(match Self::count(obj) {
            Ok(have) => format!("{} data entries", have),
            Err(e) => e.to_string(),
        })
    }
}

/// Conjunction of predicates over the same snapshot.
pub struct AllOf<O> {
    parts: Vec<Box<dyn Predicate<O>>>,
}

pub fn all_of<O>(parts: Vec<Box<dyn Predicate<O>>>) -> AllOf<O> {
    AllOf { parts }
}

impl<O> Predicate<O> for AllOf<O> {
    fn evaluate(&self, obj: &O) -> Result<bool, PredicateError> {
        // Keep going past an unsatisfied part so a later terminal error still surfaces.
        let mut satisfied = true;
        for p in &self.parts {
            if !Predicate::<O>::evaluate(p.as_ref(), obj)? {
                satisfied = false;
            }
        }
        Ok(satisfied)
    }

    fn describe(&self) -> String {
        self.parts.iter().map(|p| Predicate::<O>::describe(p.as_ref())).collect::<Vec<_>>().join(" and ")
    }

    fn observe(&self, obj: &O) -> Option<String> {
        let seen: Vec<String> = self.parts.iter().filter_map(|p| Predicate::<O>::observe(p.as_ref(), obj)).collect();
        if seen.is_empty() {
            None
        } else {
            Some(seen.join(", "))
        }
    }
}

/// Ad-hoc predicate from a closure.
pub struct FnPredicate<F> {
    description: String,
    f: F,
}

impl<F> FnPredicate<F> {
    pub fn new(description: impl Into<String>, f: F) -> Self {
        Self { description: description.into(), f }
    }
}

impl<O, F> Predicate<O> for FnPredicate<F>
where
    O: ?Sized,
    F: Fn(&O) -> Result<bool, PredicateError> + Send + Sync,
{
    fn evaluate(&self, obj: &O) -> Result<bool, PredicateError> {
        (self.f)(obj)
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

/// Issuer has registered and reports `Ready=True`.
pub fn issuer_ready() -> ConditionPredicate {
    condition("Ready", "True")
}

/// ACME account URI has been recorded on the issuer status.
pub fn acme_account_registered() -> FieldNonEmpty {
    field_non_empty("status.acme.uri")
}

/// Certificate is `Ready=True` and carries an expiry. No cryptographic checks.
pub fn certificate_issued() -> AllOf<Value> {
    all_of(vec![Box::new(condition("Ready", "True")), Box::new(field_non_empty("status.notAfter"))])
}

/// Resolve a dotted path through nested JSON objects.
pub fn lookup<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').filter(|s| !s.is_empty()).try_fold(obj, |cur, key| cur.get(key))
}
