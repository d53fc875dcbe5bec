use std::cmp::Ordering;
use serde::{Serialize, Deserialize};
use crate::core::numeric::NumericValue;
use crate::core::types::{TypedObject, Value};

/// Filter tree evaluated against materialized objects and mined for
/// constant fields by the index selector.
///
/// All transforms (`negate`, `normalize`, `Clone`) are pure: they build new
/// trees and never mutate the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    FieldEqualTo { field: String, value: Value },
    FieldNotEqualTo { field: String, value: Value },
    FieldGreaterThan { field: String, value: Value },
    FieldGreaterOrEqualTo { field: String, value: Value },
    FieldLesserThan { field: String, value: Value },
    FieldLesserOrEqualTo { field: String, value: Value },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

/// Compare two field values. Values of one class compare directly; numeric
/// kinds (and numeric strings) compare through [`NumericValue`], the same
/// promotion deserialization applies. `None` means the values are not
/// comparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::String(x), Value::String(y))
        | (Value::Enum(x), Value::Enum(y))
        | (Value::String(x), Value::Enum(y))
        | (Value::Enum(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Guid(x), Value::Guid(y)) => Some(x.as_bytes().cmp(y.as_bytes())),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        (Value::ByteArray(x), Value::ByteArray(y)) => Some(x.cmp(y)),
        (Value::Char(x), Value::Char(y)) => Some(x.cmp(y)),
        _ => {
            let x = NumericValue::from_value(a)?;
            let y = NumericValue::from_value(b)?;
            Some(NumericValue::compare(&x, &y))
        }
    }
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: Value) -> Filter {
        Filter::FieldEqualTo {
            field: field.into(),
            value,
        }
    }

    pub fn ne(field: impl Into<String>, value: Value) -> Filter {
        Filter::FieldNotEqualTo {
            field: field.into(),
            value,
        }
    }

    pub fn gt(field: impl Into<String>, value: Value) -> Filter {
        Filter::FieldGreaterThan {
            field: field.into(),
            value,
        }
    }

    pub fn ge(field: impl Into<String>, value: Value) -> Filter {
        Filter::FieldGreaterOrEqualTo {
            field: field.into(),
            value,
        }
    }

    pub fn lt(field: impl Into<String>, value: Value) -> Filter {
        Filter::FieldLesserThan {
            field: field.into(),
            value,
        }
    }

    pub fn le(field: impl Into<String>, value: Value) -> Filter {
        Filter::FieldLesserOrEqualTo {
            field: field.into(),
            value,
        }
    }

    pub fn and(filters: Vec<Filter>) -> Filter {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Filter {
        Filter::Or(filters)
    }

    pub fn not(filter: Filter) -> Filter {
        Filter::Not(Box::new(filter))
    }

    /// Evaluate against an object. A field absent from the object reads as
    /// null; And stops at the first false, Or at the first true.
    pub fn applies_to(&self, object: &TypedObject) -> bool {
        let field_value = |name: &str| object.get_field(name).unwrap_or(&Value::Null);
        match self {
            Filter::FieldEqualTo { field, value } => {
                compare_values(field_value(field), value) == Some(Ordering::Equal)
            }
            Filter::FieldNotEqualTo { field, value } => {
                // Incomparable values are unequal by definition.
                compare_values(field_value(field), value) != Some(Ordering::Equal)
            }
            Filter::FieldGreaterThan { field, value } => {
                compare_values(field_value(field), value) == Some(Ordering::Greater)
            }
            Filter::FieldGreaterOrEqualTo { field, value } => matches!(
                compare_values(field_value(field), value),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            ),
            Filter::FieldLesserThan { field, value } => {
                compare_values(field_value(field), value) == Some(Ordering::Less)
            }
            Filter::FieldLesserOrEqualTo { field, value } => matches!(
                compare_values(field_value(field), value),
                Some(Ordering::Less) | Some(Ordering::Equal)
            ),
            Filter::And(filters) => filters.iter().all(|f| f.applies_to(object)),
            Filter::Or(filters) => filters.iter().any(|f| f.applies_to(object)),
            Filter::Not(inner) => !inner.applies_to(object),
        }
    }

    /// Logical complement as a new tree. `f.negate().negate()` accepts the
    /// same objects as `f`.
    pub fn negate(&self) -> Filter {
        match self {
            Filter::FieldEqualTo { field, value } => Filter::ne(field.clone(), value.clone()),
            Filter::FieldNotEqualTo { field, value } => Filter::eq(field.clone(), value.clone()),
            Filter::FieldGreaterThan { field, value } => Filter::le(field.clone(), value.clone()),
            Filter::FieldGreaterOrEqualTo { field, value } => {
                Filter::lt(field.clone(), value.clone())
            }
            Filter::FieldLesserThan { field, value } => Filter::ge(field.clone(), value.clone()),
            Filter::FieldLesserOrEqualTo { field, value } => {
                Filter::gt(field.clone(), value.clone())
            }
            Filter::And(filters) => Filter::Or(filters.iter().map(|f| f.negate()).collect()),
            Filter::Or(filters) => Filter::And(filters.iter().map(|f| f.negate()).collect()),
            Filter::Not(inner) => (**inner).clone(),
        }
    }

    /// Push negations to the leaves (De Morgan) and flatten nested
    /// conjunctions/disjunctions, without changing which objects match.
    pub fn normalize(&self) -> Filter {
        match self {
            Filter::Not(inner) => inner.negate().normalize(),
            Filter::And(filters) => {
                let mut flat = Vec::new();
                for filter in filters {
                    match filter.normalize() {
                        Filter::And(nested) => flat.extend(nested),
                        other => flat.push(other),
                    }
                }
                Filter::And(flat)
            }
            Filter::Or(filters) => {
                let mut flat = Vec::new();
                for filter in filters {
                    match filter.normalize() {
                        Filter::Or(nested) => flat.extend(nested),
                        other => flat.push(other),
                    }
                }
                Filter::Or(flat)
            }
            leaf => leaf.clone(),
        }
    }

    /// Fields whose value this filter pins to a single constant, usable to
    /// match an index key prefix. Only equalities pin; Or and Not pin
    /// nothing.
    pub fn constant_fields(&self) -> Vec<String> {
        match self {
            Filter::FieldEqualTo { field, .. } => vec![field.clone()],
            Filter::And(filters) => {
                let mut fields = Vec::new();
                for filter in filters {
                    for field in filter.constant_fields() {
                        if !fields.contains(&field) {
                            fields.push(field);
                        }
                    }
                }
                fields
            }
            _ => Vec::new(),
        }
    }

    /// The constant value a normalized filter pins `field` to, if any.
    pub fn constant_value(&self, field: &str) -> Option<&Value> {
        match self {
            Filter::FieldEqualTo { field: f, value } if f == field => Some(value),
            Filter::And(filters) => filters.iter().find_map(|f| f.constant_value(field)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(x: i64) -> TypedObject {
        TypedObject::new("T").with_field("x", Value::Int64(x))
    }

    #[test]
    fn negated_equality() {
        let filter = Filter::eq("x", Value::Int32(5)).negate();
        assert!(!filter.applies_to(&obj(5)));
        assert!(filter.applies_to(&obj(6)));
    }

    #[test]
    fn double_negation_is_identity() {
        let samples = [obj(1), obj(5), obj(9)];
        let filters = vec![
            Filter::eq("x", Value::Int64(5)),
            Filter::gt("x", Value::Int64(3)),
            Filter::and(vec![
                Filter::ge("x", Value::Int64(2)),
                Filter::lt("x", Value::Int64(8)),
            ]),
            Filter::not(Filter::le("x", Value::Int64(4))),
        ];
        for filter in filters {
            let twice = filter.negate().negate();
            for sample in &samples {
                assert_eq!(filter.applies_to(sample), twice.applies_to(sample));
            }
        }
    }

    #[test]
    fn normalize_pushes_negation_to_leaves() {
        let filter = Filter::not(Filter::and(vec![
            Filter::eq("x", Value::Int64(5)),
            Filter::gt("x", Value::Int64(2)),
        ]));
        let normalized = filter.normalize();
        match &normalized {
            Filter::Or(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[0], Filter::FieldNotEqualTo { .. }));
                assert!(matches!(children[1], Filter::FieldLesserOrEqualTo { .. }));
            }
            other => panic!("expected Or, got {:?}", other),
        }
        for x in 0..10 {
            assert_eq!(filter.applies_to(&obj(x)), normalized.applies_to(&obj(x)));
        }
    }

    #[test]
    fn normalize_flattens_nested_groups() {
        let filter = Filter::and(vec![
            Filter::eq("x", Value::Int64(1)),
            Filter::and(vec![
                Filter::gt("x", Value::Int64(0)),
                Filter::lt("x", Value::Int64(9)),
            ]),
        ]);
        match filter.normalize() {
            Filter::And(children) => assert_eq!(children.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn constant_fields_only_from_equalities() {
        let filter = Filter::and(vec![
            Filter::eq("room", Value::String("lab".into())),
            Filter::gt("value", Value::Double(3.0)),
            Filter::eq("kind", Value::Enum("Temp".into())),
        ]);
        assert_eq!(filter.constant_fields(), vec!["room", "kind"]);
        assert_eq!(
            filter.constant_value("room"),
            Some(&Value::String("lab".into()))
        );
        assert_eq!(filter.constant_value("value"), None);

        let disjunction = Filter::or(vec![
            Filter::eq("room", Value::String("a".into())),
            Filter::eq("room", Value::String("b".into())),
        ]);
        assert!(disjunction.constant_fields().is_empty());
    }

    #[test]
    fn comparisons_promote_numeric_kinds() {
        let object = TypedObject::new("T").with_field("x", Value::UInt16(5));
        assert!(Filter::eq("x", Value::Double(5.0)).applies_to(&object));
        assert!(Filter::gt("x", Value::SByte(4)).applies_to(&object));
        assert!(!Filter::lt("x", Value::Int64(5)).applies_to(&object));
    }

    #[test]
    fn missing_fields_read_as_null() {
        let object = TypedObject::new("T");
        assert!(!Filter::eq("x", Value::Int64(0)).applies_to(&object));
        assert!(Filter::ne("x", Value::Int64(0)).applies_to(&object));
        assert!(Filter::eq("x", Value::Null).applies_to(&object));
    }
}
