//! Conditional write primitives shared by both backends.

use std::collections::BTreeMap;

use crate::value::{compact, to_row, AttributeValue, Item, ScalarList, Value};
use crate::Error;

/// A change to one attribute
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Set(Value),
    /// add to a number, or add members to a string set
    Add(Value),
    Remove,
}

pub type Changes = BTreeMap<String, Change>;

/// Preconditions on existing attribute values.
///
/// `Some(value)` requires equality, `None` requires the attribute to be absent.
pub type Expect = BTreeMap<String, Option<Value>>;

/// Fail with a conflict if any of the `fresh` attributes is already present
pub fn check_fresh(existing: Option<&Item>, fresh: &[&str]) -> Result<(), Error> {
    if let Some(existing) = existing {
        if let Some(attr) = fresh.iter().find(|attr| existing.contains_key(**attr)) {
            return Err(Error::Conflict(format!("{} already exists", attr)));
        }
    }
    Ok(())
}

pub fn check_expect(existing: &Item, expect: &Expect) -> Result<(), Error> {
    for (attr, expected) in expect {
        if existing.get(attr) != expected.as_ref() {
            return Err(Error::Conflict(format!(
                "{} is {:?}, expected {:?}",
                attr,
                existing.get(attr),
                expected
            )));
        }
    }
    Ok(())
}

/// Apply changes to an item in place
pub fn apply_changes(item: &mut Item, changes: &Changes) -> Result<(), Error> {
    for (attr, change) in changes {
        match change {
            Change::Set(value) => {
                item.insert(attr.clone(), value.clone());
            }
            Change::Remove => {
                item.remove(attr);
            }
            Change::Add(delta) => {
                let added = add(item.get(attr), delta)?;
                item.insert(attr.clone(), added);
            }
        }
    }
    *item = compact(item);
    Ok(())
}

fn add(existing: Option<&Value>, delta: &Value) -> Result<Value, Error> {
    Ok(match (existing, delta) {
        (None, Value::String(s)) => Value::List(ScalarList::Strings(vec![s.clone()])),
        (None, delta) => delta.clone(),
        (Some(Value::Number(a)), Value::Number(b)) => Value::Number(
            a.checked_add(*b).ok_or_else(|| Error::Codec(format!("adding {} to {} overflows", b, a)))?,
        ),
        (Some(Value::List(ScalarList::Strings(set))), Value::String(s)) => {
            let mut set = set.clone();
            if !set.contains(s) {
                set.push(s.clone());
            }
            Value::List(ScalarList::Strings(set))
        }
        (Some(Value::List(ScalarList::Strings(set))), Value::List(ScalarList::Strings(more))) => {
            let mut set = set.clone();
            for s in more {
                if !set.contains(s) {
                    set.push(s.clone());
                }
            }
            Value::List(ScalarList::Strings(set))
        }
        (Some(existing), delta) => {
            return Err(Error::Codec(format!("cannot add {:?} to {:?}", delta, existing)))
        }
    })
}

/// Fresh attributes as a remote condition expression
pub fn put_condition(fresh: &[&str]) -> Option<(String, BTreeMap<String, String>)> {
    if fresh.is_empty() {
        return None;
    }
    let names = fresh.iter().map(|attr| (format!("#{}", attr), attr.to_string())).collect();
    let condition = fresh
        .iter()
        .map(|attr| format!("attribute_not_exists(#{})", attr))
        .collect::<Vec<_>>()
        .join(" and ");
    Some((condition, names))
}

/// A remote update request body
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateExpression {
    pub update_expression: String,
    pub condition_expression: Option<String>,
    pub attribute_names: BTreeMap<String, String>,
    pub attribute_values: BTreeMap<String, AttributeValue>,
}

/// Translate changes and preconditions to `SET`/`ADD`/`REMOVE` clauses and a
/// condition expression
pub fn update_expression(changes: &Changes, expect: &Expect) -> UpdateExpression {
    let mut names = BTreeMap::new();
    let mut values = Item::new();
    let mut sets = Vec::new();
    let mut adds = Vec::new();
    let mut removes = Vec::new();
    for (attr, change) in changes {
        let name = format!("#{}", attr);
        let placeholder = format!(":{}", attr);
        match change {
            Change::Set(value) if value.is_absent() => removes.push(name.clone()),
            Change::Set(value) => {
                sets.push(format!("{} = {}", name, placeholder));
                values.insert(placeholder, value.clone());
            }
            Change::Add(delta) => {
                adds.push(format!("{} {}", name, placeholder));
                let delta = match delta {
                    Value::String(s) => Value::List(ScalarList::Strings(vec![s.clone()])),
                    other => other.clone(),
                };
                values.insert(placeholder, delta);
            }
            Change::Remove => removes.push(name.clone()),
        }
        names.insert(name, attr.clone());
    }
    let mut clauses = Vec::new();
    if !sets.is_empty() {
        clauses.push(format!("SET {}", sets.join(", ")));
    }
    if !adds.is_empty() {
        clauses.push(format!("ADD {}", adds.join(", ")));
    }
    if !removes.is_empty() {
        clauses.push(format!("REMOVE {}", removes.join(", ")));
    }

    let mut conditions = Vec::new();
    for (attr, expected) in expect {
        let name = format!("#{}", attr);
        match expected {
            Some(value) => {
                let placeholder = format!(":expected_{}", attr);
                conditions.push(format!("{} = {}", name, placeholder));
                values.insert(placeholder, value.clone());
            }
            None => conditions.push(format!("attribute_not_exists({})", name)),
        }
        names.insert(name, attr.clone());
    }

    UpdateExpression {
        update_expression: clauses.join(" "),
        condition_expression: if conditions.is_empty() { None } else { Some(conditions.join(" and ")) },
        attribute_names: names,
        attribute_values: to_row(&values),
    }
}
