//! Evaluation of remote request expressions, for document stores that do
//! not speak them natively.

use std::collections::BTreeMap;

use crate::query::compare;
use crate::value::{Item, Row, Value};
use crate::write::{Change, Changes};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Gt,
}

/// One clause of a condition expression
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare { attr: String, op: Op, value: Value },
    BeginsWith { attr: String, prefix: String },
    NotExists { attr: String },
}

impl Condition {
    /// The attribute the clause constrains
    pub fn attr(&self) -> &str {
        match self {
            Condition::Compare { attr, .. }
            | Condition::BeginsWith { attr, .. }
            | Condition::NotExists { attr } => attr,
        }
    }

    pub fn holds(&self, item: Option<&Item>) -> bool {
        let value = item.and_then(|item| item.get(self.attr()));
        match self {
            Condition::NotExists { .. } => value.is_none(),
            Condition::Compare { op: Op::Eq, value: expected, .. } => value == Some(expected),
            Condition::Compare { op: Op::Gt, value: bound, .. } => value
                .and_then(|v| compare(v, bound))
                .map(|ordering| ordering.is_gt())
                .unwrap_or(false),
            Condition::BeginsWith { prefix, .. } => value
                .and_then(|v| v.as_str())
                .map(|s| s.starts_with(prefix.as_str()))
                .unwrap_or(false),
        }
    }
}

struct Resolver<'a> {
    names: &'a BTreeMap<String, String>,
    values: &'a Row,
}

impl<'a> Resolver<'a> {
    fn name(&self, token: &str) -> Result<String, Error> {
        self.names
            .get(token.trim())
            .cloned()
            .ok_or_else(|| Error::InvalidExpression(format!("unknown name {}", token)))
    }

    fn value(&self, token: &str) -> Result<Value, Error> {
        self.values
            .get(token.trim())
            .ok_or_else(|| Error::InvalidExpression(format!("unknown value {}", token)))?
            .to_value()
    }
}

fn function_args<'e>(clause: &'e str, function: &str) -> Option<Vec<&'e str>> {
    clause
        .strip_prefix(function)
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
        .map(|args| args.split(',').map(str::trim).collect())
}

pub fn parse_conditions(
    expression: &str,
    names: &BTreeMap<String, String>,
    values: &Row,
) -> Result<Vec<Condition>, Error> {
    let resolver = Resolver { names, values };
    let mut conditions = Vec::new();
    for clause in expression.split(" and ").map(str::trim).filter(|c| !c.is_empty()) {
        let condition = if let Some(args) = function_args(clause, "attribute_not_exists") {
            match args.as_slice() {
                [name] => Condition::NotExists { attr: resolver.name(name)? },
                _ => return Err(Error::InvalidExpression(clause.to_string())),
            }
        } else if let Some(args) = function_args(clause, "begins_with") {
            match args.as_slice() {
                [name, value] => {
                    let prefix = match resolver.value(value)? {
                        Value::String(s) => s,
                        other => {
                            return Err(Error::InvalidExpression(format!(
                                "begins_with {:?}",
                                other
                            )))
                        }
                    };
                    Condition::BeginsWith { attr: resolver.name(name)?, prefix }
                }
                _ => return Err(Error::InvalidExpression(clause.to_string())),
            }
        } else {
            let tokens: Vec<&str> = clause.split_whitespace().collect();
            match tokens.as_slice() {
                [name, op, value] => {
                    let op = match *op {
                        "=" => Op::Eq,
                        ">" => Op::Gt,
                        other => return Err(Error::UnsupportedComparator(other.to_string())),
                    };
                    Condition::Compare { attr: resolver.name(name)?, op, value: resolver.value(value)? }
                }
                _ => return Err(Error::InvalidExpression(clause.to_string())),
            }
        };
        conditions.push(condition);
    }
    Ok(conditions)
}

/// Check an optional condition expression against the existing item,
/// failing with a conflict if it does not hold
pub fn check_condition(
    expression: Option<&str>,
    names: &BTreeMap<String, String>,
    values: &Row,
    existing: Option<&Item>,
) -> Result<(), Error> {
    let Some(expression) = expression else {
        return Ok(());
    };
    for condition in parse_conditions(expression, names, values)? {
        if !condition.holds(existing) {
            return Err(Error::Conflict(format!("condition on {} failed", condition.attr())));
        }
    }
    Ok(())
}

/// Parse a `SET`/`ADD`/`REMOVE` update expression
pub fn parse_update(
    expression: &str,
    names: &BTreeMap<String, String>,
    values: &Row,
) -> Result<Changes, Error> {
    let resolver = Resolver { names, values };
    let mut sections: Vec<(&str, Vec<&str>)> = Vec::new();
    for token in expression.split_whitespace() {
        match token {
            "SET" | "ADD" | "REMOVE" => sections.push((token, Vec::new())),
            _ => match sections.last_mut() {
                Some((_, tokens)) => tokens.push(token),
                None => return Err(Error::InvalidExpression(expression.to_string())),
            },
        }
    }

    let mut changes = Changes::new();
    for (keyword, tokens) in sections {
        let section = tokens.join(" ");
        for action in section.split(',').map(str::trim) {
            let parts: Vec<&str> = action.split_whitespace().collect();
            let (attr, change) = match (keyword, parts.as_slice()) {
                ("SET", [name, "=", value]) => (resolver.name(name)?, Change::Set(resolver.value(value)?)),
                ("ADD", [name, value]) => (resolver.name(name)?, Change::Add(resolver.value(value)?)),
                ("REMOVE", [name]) => (resolver.name(name)?, Change::Remove),
                _ => return Err(Error::InvalidExpression(format!("{} {}", keyword, action))),
            };
            changes.insert(attr, change);
        }
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Comparator, RemoteQuery, Where};
    use crate::value::{to_row, ScalarList};
    use crate::write::{update_expression, Expect};

    #[test]
    fn conditions_from_query() {
        let mut filter = Where::new();
        filter.insert("capacity".to_string(), Comparator::Gt(Value::Number(999)));
        filter.insert("key".to_string(), Comparator::StartsWith("00".to_string()));
        let query = RemoteQuery::new("channels", &filter);
        let conditions =
            parse_conditions(&query.key_condition_expression, &query.attribute_names, &query.attribute_values)
                .unwrap();
        assert_eq!(conditions.len(), 2);

        let mut item = Item::new();
        item.insert("key".to_string(), "00abc".into());
        item.insert("capacity".to_string(), Value::Number(1000));
        assert!(conditions.iter().all(|c| c.holds(Some(&item))));
        item.insert("capacity".to_string(), Value::Number(999));
        assert!(!conditions.iter().all(|c| c.holds(Some(&item))));
    }

    #[test]
    fn update_from_expression() {
        let mut changes = Changes::new();
        changes.insert("alias".to_string(), Change::Set("A".into()));
        changes.insert("chains".to_string(), Change::Add("01".into()));
        changes.insert("rev".to_string(), Change::Add(Value::Number(1)));
        changes.insert("sockets".to_string(), Change::Remove);
        let mut expect = Expect::new();
        expect.insert("rev".to_string(), Some(Value::Number(1)));
        let update = update_expression(&changes, &expect);

        let parsed =
            parse_update(&update.update_expression, &update.attribute_names, &update.attribute_values)
                .unwrap();
        assert_eq!(parsed["alias"], Change::Set("A".into()));
        assert_eq!(parsed["chains"], Change::Add(Value::List(ScalarList::Strings(vec!["01".to_string()]))));
        assert_eq!(parsed["rev"], Change::Add(Value::Number(1)));
        assert_eq!(parsed["sockets"], Change::Remove);

        let mut existing = Item::new();
        existing.insert("rev".to_string(), Value::Number(2));
        let condition = update.condition_expression.as_deref();
        let result =
            check_condition(condition, &update.attribute_names, &update.attribute_values, Some(&existing));
        assert!(matches!(result, Err(Error::Conflict(_))));
        existing.insert("rev".to_string(), Value::Number(1));
        check_condition(condition, &update.attribute_names, &update.attribute_values, Some(&existing))
            .unwrap();
    }

    #[test]
    fn malformed_expressions() {
        let names = BTreeMap::from([("#a".to_string(), "a".to_string())]);
        let values = to_row(&Item::from([(":a".to_string(), Value::Number(1))]));
        assert!(parse_conditions("#a < :a", &names, &values).is_err());
        assert!(parse_conditions("#b = :a", &names, &values).is_err());
        assert!(parse_conditions("#a = :b", &names, &values).is_err());
        assert!(parse_update("#a = :a", &names, &values).is_err());
        assert!(parse_update("SET #a :a", &names, &values).is_err());
        assert!(check_condition(Some("attribute_not_exists(#a)"), &names, &values, None).is_ok());
    }
}
