//! Query parameters, their validation and canonical form.

use crate::error::{BridgeError, Result};
use crate::types::DatabasePath;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A bound passed to `start_at`, `end_at` or `equal_to`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl QueryValue {
    fn canonical(&self) -> String {
        match self {
            QueryValue::Null => "null".to_string(),
            QueryValue::Bool(b) => b.to_string(),
            // -0 and 0 are the same bound
            QueryValue::Number(n) if *n == 0.0 => "0".to_string(),
            QueryValue::Number(n) => n.to_string(),
            QueryValue::String(s) => Value::String(s.clone()).to_string(),
        }
    }
}

impl From<&str> for QueryValue {
    fn from(s: &str) -> Self {
        QueryValue::String(s.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(s: String) -> Self {
        QueryValue::String(s)
    }
}

impl From<f64> for QueryValue {
    fn from(n: f64) -> Self {
        QueryValue::Number(n)
    }
}

impl From<i64> for QueryValue {
    fn from(n: i64) -> Self {
        QueryValue::Number(n as f64)
    }
}

impl From<i32> for QueryValue {
    fn from(n: i32) -> Self {
        QueryValue::Number(f64::from(n))
    }
}

impl From<bool> for QueryValue {
    fn from(b: bool) -> Self {
        QueryValue::Bool(b)
    }
}

/// How results are ordered.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    Priority,
    Key,
    Value,
    Child(String),
}

impl OrderBy {
    fn canonical(&self) -> String {
        let name = match self {
            OrderBy::Priority => "$priority",
            OrderBy::Key => "$key",
            OrderBy::Value => "$value",
            OrderBy::Child(path) => path.as_str(),
        };
        Value::String(name.to_string()).to_string()
    }
}

/// One end of a range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryBound {
    pub value: QueryValue,
    /// Tie-breaking child key.
    pub key: Option<String>,
}

impl QueryBound {
    fn canonical(&self) -> String {
        match &self.key {
            Some(key) => format!(
                "{},{}",
                self.value.canonical(),
                Value::String(key.clone())
            ),
            None => self.value.canonical(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    First(u32),
    Last(u32),
}

/// Ordering and filtering constraints of a query.
///
/// Immutable: every refinement returns a new value after validating it
/// against the constraints already present.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    pub order_by: Option<OrderBy>,
    pub start: Option<QueryBound>,
    pub end: Option<QueryBound>,
    pub limit: Option<Limit>,
}

impl QueryParams {
    pub fn is_default(&self) -> bool {
        *self == QueryParams::default()
    }

    pub fn order_by(&self, order: OrderBy) -> Result<Self> {
        if self.order_by.is_some() {
            return Err(invalid("You can't combine multiple order_by calls"));
        }
        if let OrderBy::Child(path) = &order {
            validate_order_by_child(path)?;
        }
        let next = Self {
            order_by: Some(order),
            ..self.clone()
        };
        next.validate_bounds()?;
        Ok(next)
    }

    pub fn start_at(&self, value: QueryValue, key: Option<String>) -> Result<Self> {
        if self.start.is_some() {
            return Err(invalid("start_at or equal_to was already set"));
        }
        validate_value(&value)?;
        let next = Self {
            start: Some(QueryBound { value, key }),
            ..self.clone()
        };
        next.validate_bounds()?;
        Ok(next)
    }

    pub fn end_at(&self, value: QueryValue, key: Option<String>) -> Result<Self> {
        if self.end.is_some() {
            return Err(invalid("end_at or equal_to was already set"));
        }
        validate_value(&value)?;
        let next = Self {
            end: Some(QueryBound { value, key }),
            ..self.clone()
        };
        next.validate_bounds()?;
        Ok(next)
    }

    pub fn equal_to(&self, value: QueryValue, key: Option<String>) -> Result<Self> {
        if self.start.is_some() || self.end.is_some() {
            return Err(invalid("equal_to cannot be combined with start_at or end_at"));
        }
        validate_value(&value)?;
        let bound = QueryBound { value, key };
        let next = Self {
            start: Some(bound.clone()),
            end: Some(bound),
            ..self.clone()
        };
        next.validate_bounds()?;
        Ok(next)
    }

    pub fn limit(&self, limit: Limit) -> Result<Self> {
        if self.limit.is_some() {
            return Err(invalid("A limit was already set"));
        }
        let n = match limit {
            Limit::First(n) | Limit::Last(n) => n,
        };
        if n == 0 {
            return Err(invalid("Limit must be a positive integer"));
        }
        Ok(Self {
            limit: Some(limit),
            ..self.clone()
        })
    }

    /// Check bound types against the ordering mode.
    fn validate_bounds(&self) -> Result<()> {
        let bounds = self.start.iter().chain(self.end.iter());
        match self.order_by {
            Some(OrderBy::Key) => {
                for bound in bounds {
                    if !matches!(bound.value, QueryValue::String(_)) || bound.key.is_some() {
                        return Err(invalid(
                            "order_by_key requires string bounds without a child key",
                        ));
                    }
                }
            }
            Some(OrderBy::Priority) => {
                for bound in bounds {
                    if matches!(bound.value, QueryValue::Bool(_)) {
                        return Err(invalid(
                            "order_by_priority bounds must be valid priorities (null, number or string)",
                        ));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn canonical(&self) -> String {
        let mut parts = Vec::new();
        if let Some(order) = &self.order_by {
            parts.push(format!("orderBy={}", order.canonical()));
        }
        if let Some(start) = &self.start {
            parts.push(format!("startAt={}", start.canonical()));
        }
        if let Some(end) = &self.end {
            parts.push(format!("endAt={}", end.canonical()));
        }
        match self.limit {
            Some(Limit::First(n)) => parts.push(format!("limitToFirst={}", n)),
            Some(Limit::Last(n)) => parts.push(format!("limitToLast={}", n)),
            None => {}
        }
        parts.join("&")
    }
}

fn invalid(message: &str) -> BridgeError {
    BridgeError::InvalidQuery(message.to_string())
}

fn validate_value(value: &QueryValue) -> Result<()> {
    if let QueryValue::Number(n) = value {
        if !n.is_finite() {
            return Err(invalid("query bounds must be finite numbers"));
        }
    }
    Ok(())
}

fn validate_order_by_child(path: &str) -> Result<()> {
    if path.trim_matches('/').is_empty() {
        return Err(invalid("order_by_child requires a non-empty path"));
    }
    if path.starts_with('$') {
        return Err(invalid(
            "order_by_child path is reserved; use order_by_key, order_by_value or order_by_priority",
        ));
    }
    DatabasePath::parse(path).map_err(|e| BridgeError::InvalidQuery(e.to_string()))?;
    Ok(())
}

/// Everything the native service needs to identify a query.
///
/// Equality and hashing use the canonical string: database URL, path and
/// parameters.
#[derive(Clone)]
pub struct QuerySpec {
    url: String,
    path: DatabasePath,
    params: QueryParams,
    canonical: String,
}

impl QuerySpec {
    pub fn new(url: &str, path: DatabasePath, params: QueryParams) -> Self {
        let mut canonical = format!("{}{}", url.trim_end_matches('/'), path);
        if !params.is_default() {
            canonical.push('?');
            canonical.push_str(&params.canonical());
        }
        Self {
            url: url.to_string(),
            path,
            params,
            canonical,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &DatabasePath {
        &self.path
    }

    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for QuerySpec {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for QuerySpec {}

impl Hash for QuerySpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Debug for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuerySpec({})", self.canonical)
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://demo.example.com/";

    fn games() -> DatabasePath {
        DatabasePath::parse("games").unwrap()
    }

    #[test]
    fn test_canonical_form() {
        let params = QueryParams::default()
            .order_by(OrderBy::Child("score".to_string()))
            .unwrap()
            .start_at(10.into(), None)
            .unwrap()
            .limit(Limit::First(5))
            .unwrap();
        let spec = QuerySpec::new(URL, games(), params);
        assert_eq!(
            spec.canonical(),
            "https://demo.example.com/games?orderBy=\"score\"&startAt=10&limitToFirst=5"
        );

        let plain = QuerySpec::new(URL, games(), QueryParams::default());
        assert_eq!(plain.canonical(), "https://demo.example.com/games");
    }

    #[test]
    fn test_order_by_key_rejects_non_string_bounds() {
        let keyed = QueryParams::default().order_by(OrderBy::Key).unwrap();
        assert!(matches!(
            keyed.start_at(5.into(), None),
            Err(BridgeError::InvalidQuery(_))
        ));
        assert!(keyed.start_at("a".into(), Some("k".to_string())).is_err());
        assert!(keyed.end_at("m".into(), None).is_ok());

        // Order of calls does not matter
        let bounded = QueryParams::default().equal_to(true.into(), None).unwrap();
        assert!(bounded.order_by(OrderBy::Key).is_err());
    }

    #[test]
    fn test_order_by_priority_rejects_bool() {
        let by_priority = QueryParams::default().order_by(OrderBy::Priority).unwrap();
        assert!(by_priority.start_at(false.into(), None).is_err());
        assert!(by_priority.start_at(QueryValue::Null, None).is_ok());
        assert!(by_priority.end_at("b".into(), None).is_ok());
    }

    #[test]
    fn test_repeated_refinements_rejected() {
        let ordered = QueryParams::default().order_by(OrderBy::Value).unwrap();
        assert!(ordered.order_by(OrderBy::Key).is_err());

        let started = QueryParams::default().start_at(1.into(), None).unwrap();
        assert!(started.start_at(2.into(), None).is_err());
        assert!(started.equal_to(2.into(), None).is_err());

        let limited = QueryParams::default().limit(Limit::Last(3)).unwrap();
        assert!(limited.limit(Limit::First(3)).is_err());
        assert!(QueryParams::default().limit(Limit::First(0)).is_err());
    }

    #[test]
    fn test_order_by_child_path_validation() {
        let params = QueryParams::default();
        assert!(params.order_by(OrderBy::Child(String::new())).is_err());
        assert!(params.order_by(OrderBy::Child("$key".to_string())).is_err());
        assert!(params.order_by(OrderBy::Child("a.b".to_string())).is_err());
        assert!(params.order_by(OrderBy::Child("stats/score".to_string())).is_ok());
    }

    #[test]
    fn test_signed_zero_bounds_are_equal() {
        let negative = QueryParams::default().start_at((-0.0f64).into(), None).unwrap();
        let positive = QueryParams::default().start_at(0.0f64.into(), None).unwrap();
        assert_eq!(
            QuerySpec::new(URL, games(), negative),
            QuerySpec::new(URL, games(), positive)
        );
    }

    #[test]
    fn test_non_finite_number_rejected() {
        assert!(QueryParams::default()
            .start_at(f64::NAN.into(), None)
            .is_err());
    }
}
