//! Declarative where-clauses and their translation to each backend.

use core::cmp::Ordering;
use std::collections::BTreeMap;

use crate::value::{to_row, AttributeValue, Item, Value};
use crate::Error;

/// Comparison of one attribute against a value
#[derive(Debug, Clone, PartialEq)]
pub enum Comparator {
    Eq(Value),
    Gt(Value),
    StartsWith(String),
}

impl Comparator {
    /// Build a comparator from its name
    pub fn from_name(name: &str, value: Value) -> Result<Self, Error> {
        match name {
            "eq" => Ok(Comparator::Eq(value)),
            "gt" => Ok(Comparator::Gt(value)),
            "starts_with" => match value {
                Value::String(s) => Ok(Comparator::StartsWith(s)),
                other => Err(Error::UnsupportedComparator(format!("starts_with {:?}", other))),
            },
            other => Err(Error::UnsupportedComparator(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Comparator::Eq(_) => "eq",
            Comparator::Gt(_) => "gt",
            Comparator::StartsWith(_) => "starts_with",
        }
    }

    pub fn value(&self) -> Value {
        match self {
            Comparator::Eq(v) | Comparator::Gt(v) => v.clone(),
            Comparator::StartsWith(s) => Value::String(s.clone()),
        }
    }

    pub fn matches(&self, value: Option<&Value>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match self {
            Comparator::Eq(expected) => value == expected,
            Comparator::Gt(bound) => compare(value, bound) == Some(Ordering::Greater),
            Comparator::StartsWith(prefix) => {
                value.as_str().map(|s| s.starts_with(prefix.as_str())).unwrap_or(false)
            }
        }
    }
}

/// Order two values of the same scalar type
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Attribute name to comparator
pub type Where = BTreeMap<String, Comparator>;

pub fn matches_where(item: &Item, filter: &Where) -> bool {
    filter.iter().all(|(attr, comparator)| comparator.matches(item.get(attr)))
}

/// Bounds on the key itself, for ordered scans
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyRange {
    pub starts_with: Option<String>,
    /// inclusive upper bound
    pub before: Option<String>,
}

/// A forward cursor scan over the embedded backend
#[derive(Debug, Clone, Default)]
pub struct ScanPlan {
    pub range: KeyRange,
    pub filter: Where,
    pub limit: Option<usize>,
}

impl ScanPlan {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        ScanPlan { range: KeyRange { starts_with: Some(prefix.into()), before: None }, ..Default::default() }
    }

    pub fn before(mut self, before: Option<String>) -> Self {
        self.range.before = before;
        self
    }

    pub fn filter(mut self, filter: Where) -> Self {
        self.filter = filter;
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Key to seek to
    pub fn start(&self) -> &str {
        self.range.starts_with.as_deref().unwrap_or("")
    }

    /// Whether the scan continues at this key. Keys arrive in ascending
    /// order, so the first key out of range ends the scan.
    pub fn in_range(&self, key: &str) -> bool {
        if let Some(prefix) = &self.range.starts_with {
            if !key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        match &self.range.before {
            Some(before) => key <= before.as_str(),
            None => true,
        }
    }

    pub fn accepts(&self, item: &Item) -> bool {
        matches_where(item, &self.filter)
    }

    pub fn is_full(&self, found: usize) -> bool {
        self.limit.map(|limit| found >= limit).unwrap_or(false)
    }
}

/// A query against the remote backend, in its native request shape
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteQuery {
    pub table: String,
    pub index_name: Option<String>,
    pub key_condition_expression: String,
    pub attribute_names: BTreeMap<String, String>,
    pub attribute_values: BTreeMap<String, AttributeValue>,
    pub scan_index_forward: bool,
    pub limit: Option<usize>,
}

impl RemoteQuery {
    pub fn new(table: &str, filter: &Where) -> Self {
        let mut attribute_names = BTreeMap::new();
        let mut values = Item::new();
        let mut matches = Vec::new();
        for (attr, comparator) in filter {
            let name = format!("#{}", attr);
            let placeholder = format!(":{}", attr);
            matches.push(match comparator {
                Comparator::Eq(_) => format!("{} = {}", name, placeholder),
                Comparator::Gt(_) => format!("{} > {}", name, placeholder),
                Comparator::StartsWith(_) => format!("begins_with({}, {})", name, placeholder),
            });
            attribute_names.insert(name, attr.clone());
            values.insert(placeholder, comparator.value());
        }
        RemoteQuery {
            table: table.to_string(),
            index_name: None,
            key_condition_expression: matches.join(" and "),
            attribute_names,
            attribute_values: to_row(&values),
            scan_index_forward: true,
            limit: None,
        }
    }

    pub fn index(mut self, index_name: &str) -> Self {
        self.index_name = Some(index_name.to_string());
        self
    }

    pub fn descending(mut self, is_descending: bool) -> Self {
        self.scan_index_forward = !is_descending;
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(entries: &[(&str, &str, Value)]) -> Where {
        entries
            .iter()
            .map(|(attr, name, value)| {
                (attr.to_string(), Comparator::from_name(name, value.clone()).unwrap())
            })
            .collect()
    }

    #[test]
    fn remote_translation() {
        let filter = filter(&[
            ("capacity", "gt", Value::Number(999)),
            ("key", "starts_with", "00".into()),
            ("node1_public_key", "eq", "02ab".into()),
        ]);
        let query = RemoteQuery::new("graph-channels", &filter)
            .index("node1_public_key-key-index")
            .descending(true)
            .limit(Some(10));
        assert_eq!(
            query.key_condition_expression,
            "#capacity > :capacity and begins_with(#key, :key) and #node1_public_key = :node1_public_key"
        );
        assert_eq!(query.attribute_names["#key"], "key");
        assert_eq!(query.attribute_values[":capacity"], AttributeValue::N("999".to_string()));
        assert_eq!(query.index_name.as_deref(), Some("node1_public_key-key-index"));
        assert!(!query.scan_index_forward);
        assert_eq!(query.limit, Some(10));
    }

    #[test]
    fn unsupported_comparator() {
        assert!(matches!(
            Comparator::from_name("lt", Value::Number(1)),
            Err(Error::UnsupportedComparator(_))
        ));
        assert!(Comparator::from_name("starts_with", Value::Number(1)).is_err());
    }

    #[test]
    fn predicate() {
        let mut item = Item::new();
        item.insert("capacity".to_string(), Value::Number(1000));
        item.insert("alias".to_string(), "alice".into());
        assert!(matches_where(&item, &filter(&[("capacity", "gt", Value::Number(999))])));
        assert!(!matches_where(&item, &filter(&[("capacity", "gt", Value::Number(1000))])));
        assert!(!matches_where(&item, &filter(&[("capacity", "gt", "1".into())])));
        assert!(matches_where(&item, &filter(&[("alias", "starts_with", "al".into())])));
        assert!(!matches_where(&item, &filter(&[("color", "starts_with", "#".into())])));
        assert!(matches_where(&item, &filter(&[("alias", "eq", "alice".into())])));
    }

    #[test]
    fn scan_bounds() {
        let plan = ScanPlan::prefix("ab").before(Some("ab5".to_string())).limit(Some(2));
        assert_eq!(plan.start(), "ab");
        assert!(plan.in_range("ab1"));
        assert!(plan.in_range("ab5"));
        assert!(!plan.in_range("ab6"));
        assert!(!plan.in_range("ac"));
        assert!(!plan.is_full(1));
        assert!(plan.is_full(2));
    }
}
