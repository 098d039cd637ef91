//! Key definitions: which tuple fields form an index key, their types,
//! and how keys compare.

use std::cmp::Ordering;

use rmpv::Value;

use kestrel_common::error::IndexError;

use crate::tuple::Tuple;

/// Type of one key part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Unsigned,
    Integer,
    Double,
    String,
    Boolean,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Unsigned => "unsigned",
            FieldType::Integer => "integer",
            FieldType::Double => "double",
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
        }
    }
}

/// One part of a key definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPart {
    /// Zero-based tuple field the part reads.
    pub field_no: u32,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl KeyPart {
    pub fn new(field_no: u32, field_type: FieldType) -> KeyPart {
        KeyPart {
            field_no,
            field_type,
            nullable: false,
        }
    }
}

/// A single comparable key field value with a total order: nulls first,
/// then booleans, then numbers (cross-type numeric compare), then strings.
/// Equality is defined by the same order, so `Unsigned(4)` equals
/// `Double(4.0)` — required for map keys to stay consistent with `Ord`.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Unsigned(u64),
    Integer(i64),
    Double(f64),
    Str(String),
}

impl FieldValue {
    fn rank(&self) -> u8 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Bool(_) => 1,
            FieldValue::Unsigned(_) | FieldValue::Integer(_) | FieldValue::Double(_) => 2,
            FieldValue::Str(_) => 3,
        }
    }

    fn numeric_cmp(&self, other: &FieldValue) -> Ordering {
        use FieldValue::*;
        match (self, other) {
            (Unsigned(a), Unsigned(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Unsigned(a), Integer(b)) => {
                if *b < 0 {
                    Ordering::Greater
                } else {
                    a.cmp(&(*b as u64))
                }
            }
            (Integer(a), Unsigned(b)) => {
                if *a < 0 {
                    Ordering::Less
                } else {
                    (*a as u64).cmp(b)
                }
            }
            (Double(a), Double(b)) => a.total_cmp(b),
            (Double(a), Unsigned(b)) => a.total_cmp(&(*b as f64)),
            (Double(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (Unsigned(a), Double(b)) => (*a as f64).total_cmp(b),
            (Integer(a), Double(b)) => (*a as f64).total_cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FieldValue {}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldValue {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_rank = self.rank().cmp(&other.rank());
        if by_rank != Ordering::Equal {
            return by_rank;
        }
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => Ordering::Equal,
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a.cmp(b),
            (FieldValue::Str(a), FieldValue::Str(b)) => a.cmp(b),
            _ => self.numeric_cmp(other),
        }
    }
}

/// Convert a msgpack value into a `FieldValue`, checking it against the
/// part's declared type.
fn value_to_field(value: &Value, part: &KeyPart) -> Result<FieldValue, IndexError> {
    let mismatch = || IndexError::FieldType {
        field_no: part.field_no,
        expected: part.field_type.name(),
    };
    if value.is_nil() {
        return if part.nullable {
            Ok(FieldValue::Null)
        } else {
            Err(mismatch())
        };
    }
    match part.field_type {
        FieldType::Unsigned => value.as_u64().map(FieldValue::Unsigned).ok_or_else(mismatch),
        FieldType::Integer => value.as_i64().map(FieldValue::Integer).ok_or_else(mismatch),
        FieldType::Double => match value {
            Value::F64(f) => Ok(FieldValue::Double(*f)),
            Value::F32(f) => Ok(FieldValue::Double(*f as f64)),
            Value::Integer(_) => Ok(FieldValue::Double(
                value.as_f64().ok_or_else(mismatch)?,
            )),
            _ => Err(mismatch()),
        },
        FieldType::String => value
            .as_str()
            .map(|s| FieldValue::Str(s.to_string()))
            .ok_or_else(mismatch),
        FieldType::Boolean => value.as_bool().map(FieldValue::Bool).ok_or_else(mismatch),
    }
}

/// A key definition: the ordered parts plus the uniqueness contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDef {
    pub parts: Vec<KeyPart>,
    pub unique: bool,
}

impl KeyDef {
    pub fn new(parts: Vec<KeyPart>, unique: bool) -> KeyDef {
        KeyDef { parts, unique }
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Extract and validate the key fields of a tuple.
    pub fn extract_key(&self, tuple: &Tuple) -> Result<Vec<FieldValue>, IndexError> {
        let mut key = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            let field = tuple.field(part.field_no as usize).ok_or(
                IndexError::MissingField {
                    have: tuple.field_count(),
                    need: part.field_no as usize + 1,
                },
            )?;
            key.push(value_to_field(field, part)?);
        }
        Ok(key)
    }

    /// Validate that a tuple can live in this index.
    pub fn validate_tuple(&self, tuple: &Tuple) -> Result<(), IndexError> {
        self.extract_key(tuple).map(|_| ())
    }

    /// Convert a wire key (msgpack values) into comparable key fields.
    /// Partial keys (a prefix of the parts) are allowed.
    pub fn validate_key(&self, key: &[Value]) -> Result<Vec<FieldValue>, IndexError> {
        if key.len() > self.parts.len() {
            return Err(IndexError::MissingField {
                have: self.parts.len(),
                need: key.len(),
            });
        }
        key.iter()
            .zip(&self.parts)
            .map(|(v, p)| value_to_field(v, p))
            .collect()
    }

    /// Compare two tuples by this definition. Fields that are absent or
    /// fail type interpretation sort as nulls; insertion validates types,
    /// so this only matters for tuples that never entered the index.
    pub fn compare(&self, a: &Tuple, b: &Tuple) -> Ordering {
        for part in &self.parts {
            let fa = self.field_loose(a, part);
            let fb = self.field_loose(b, part);
            let ord = fa.cmp(&fb);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Compare a tuple against a (possibly partial) key: only the key's
    /// leading parts participate.
    pub fn compare_with_key(&self, tuple: &Tuple, key: &[FieldValue]) -> Ordering {
        for (part, kf) in self.parts.iter().zip(key) {
            let tf = self.field_loose(tuple, part);
            let ord = tf.cmp(kf);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    fn field_loose(&self, tuple: &Tuple, part: &KeyPart) -> FieldValue {
        tuple
            .field(part.field_no as usize)
            .and_then(|v| value_to_field(v, &relaxed(part)).ok())
            .unwrap_or(FieldValue::Null)
    }

    /// Extend a secondary key definition with the primary's parts so that
    /// equal secondary keys still order totally. Parts already present are
    /// not repeated; the merged definition is unique by construction.
    pub fn merge(&self, primary: &KeyDef) -> KeyDef {
        let mut parts = self.parts.clone();
        for part in &primary.parts {
            if !parts.iter().any(|p| p.field_no == part.field_no) {
                parts.push(part.clone());
            }
        }
        KeyDef {
            parts,
            unique: true,
        }
    }
}

fn relaxed(part: &KeyPart) -> KeyPart {
    KeyPart {
        nullable: true,
        ..part.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(fields: Vec<Value>) -> Tuple {
        Tuple::new(fields)
    }

    fn unsigned_def() -> KeyDef {
        KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)], true)
    }

    #[test]
    fn extract_validates_types() {
        let def = unsigned_def();
        let ok = t(vec![Value::from(5u64), Value::from("x")]);
        assert_eq!(def.extract_key(&ok).unwrap(), vec![FieldValue::Unsigned(5)]);

        let bad = t(vec![Value::from("five")]);
        assert!(matches!(
            def.extract_key(&bad),
            Err(IndexError::FieldType { field_no: 0, .. })
        ));

        let short = t(vec![]);
        assert!(matches!(
            def.extract_key(&short),
            Err(IndexError::MissingField { .. })
        ));
    }

    #[test]
    fn compare_orders_by_parts() {
        let def = KeyDef::new(
            vec![
                KeyPart::new(1, FieldType::String),
                KeyPart::new(0, FieldType::Unsigned),
            ],
            false,
        );
        let a = t(vec![Value::from(2u64), Value::from("a")]);
        let b = t(vec![Value::from(1u64), Value::from("b")]);
        let c = t(vec![Value::from(9u64), Value::from("a")]);
        assert_eq!(def.compare(&a, &b), Ordering::Less);
        assert_eq!(def.compare(&a, &c), Ordering::Less);
        assert_eq!(def.compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn compare_with_key_is_prefix_compare() {
        let def = KeyDef::new(
            vec![
                KeyPart::new(0, FieldType::Unsigned),
                KeyPart::new(1, FieldType::String),
            ],
            true,
        );
        let tuple = t(vec![Value::from(5u64), Value::from("m")]);
        assert_eq!(
            def.compare_with_key(&tuple, &[FieldValue::Unsigned(5)]),
            Ordering::Equal
        );
        assert_eq!(
            def.compare_with_key(&tuple, &[FieldValue::Unsigned(6)]),
            Ordering::Less
        );
        assert_eq!(
            def.compare_with_key(
                &tuple,
                &[FieldValue::Unsigned(5), FieldValue::Str("a".into())]
            ),
            Ordering::Greater
        );
    }

    #[test]
    fn merge_appends_missing_primary_parts() {
        let secondary = KeyDef::new(vec![KeyPart::new(2, FieldType::String)], false);
        let primary = unsigned_def();
        let merged = secondary.merge(&primary);
        assert_eq!(merged.parts.len(), 2);
        assert_eq!(merged.parts[0].field_no, 2);
        assert_eq!(merged.parts[1].field_no, 0);
        assert!(merged.unique);

        // A secondary already covering the primary part gains nothing.
        let covering = KeyDef::new(
            vec![
                KeyPart::new(0, FieldType::Unsigned),
                KeyPart::new(1, FieldType::String),
            ],
            false,
        );
        assert_eq!(covering.merge(&primary).parts.len(), 2);
    }

    #[test]
    fn field_value_total_order() {
        let mut values = vec![
            FieldValue::Str("b".into()),
            FieldValue::Unsigned(10),
            FieldValue::Null,
            FieldValue::Integer(-3),
            FieldValue::Double(2.5),
            FieldValue::Bool(true),
            FieldValue::Bool(false),
            FieldValue::Str("a".into()),
        ];
        values.sort();
        assert_eq!(values[0], FieldValue::Null);
        assert_eq!(values[1], FieldValue::Bool(false));
        assert_eq!(values[2], FieldValue::Bool(true));
        assert_eq!(values[3], FieldValue::Integer(-3));
        assert_eq!(values[4], FieldValue::Double(2.5));
        assert_eq!(values[5], FieldValue::Unsigned(10));
        assert_eq!(values[6], FieldValue::Str("a".into()));
    }

    #[test]
    fn cross_type_numeric_compare() {
        assert_eq!(
            FieldValue::Unsigned(5).cmp(&FieldValue::Integer(-1)),
            Ordering::Greater
        );
        assert_eq!(
            FieldValue::Integer(3).cmp(&FieldValue::Double(3.5)),
            Ordering::Less
        );
        assert_eq!(
            FieldValue::Unsigned(4).cmp(&FieldValue::Double(4.0)),
            Ordering::Equal
        );
    }

    #[test]
    fn nullable_part_accepts_nil() {
        let mut part = KeyPart::new(0, FieldType::Unsigned);
        part.nullable = true;
        let def = KeyDef::new(vec![part], false);
        let tuple = t(vec![Value::Nil]);
        assert_eq!(def.extract_key(&tuple).unwrap(), vec![FieldValue::Null]);
    }
}
