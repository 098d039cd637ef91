//! Update operations: a tiny op language applied to a decoded field
//! vector, re-encoded into a fresh tuple.
//!
//! Ops are `[op, field_no, argument]` triples: `"="` assign, `"+"`/`"-"`
//! arithmetic, `"!"` insert before, `"#"` delete a run of fields.

use rmpv::Value;

use kestrel_common::error::EngineError;
use kestrel_index::Tuple;

fn bad(op: &str, detail: impl std::fmt::Display) -> EngineError {
    EngineError::UpdateOp(format!("op '{op}': {detail}"))
}

/// Apply `ops` in order to a copy of `tuple`'s fields.
pub fn apply_ops(tuple: &Tuple, ops: &[Value]) -> Result<Tuple, EngineError> {
    let mut fields: Vec<Value> = tuple.fields().to_vec();
    for op in ops {
        let parts = match op {
            Value::Array(parts) if parts.len() == 3 => parts,
            _ => {
                return Err(EngineError::UpdateOp(
                    "each op must be a [op, field, argument] triple".into(),
                ))
            }
        };
        let name = parts[0]
            .as_str()
            .ok_or_else(|| EngineError::UpdateOp("op code must be a string".into()))?;
        let field = parts[1]
            .as_u64()
            .ok_or_else(|| bad(name, "field number must be unsigned"))? as usize;
        let arg = &parts[2];

        match name {
            "=" => {
                let slot = fields
                    .get_mut(field)
                    .ok_or_else(|| bad("=", format!("field {field} out of range")))?;
                *slot = arg.clone();
            }
            "+" | "-" => {
                let slot = fields
                    .get_mut(field)
                    .ok_or_else(|| bad(name, format!("field {field} out of range")))?;
                *slot = arith(name, slot, arg)?;
            }
            "!" => {
                if field > fields.len() {
                    return Err(bad("!", format!("field {field} out of range")));
                }
                fields.insert(field, arg.clone());
            }
            "#" => {
                let count = arg
                    .as_u64()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| bad("#", "count must be a positive integer"))?
                    as usize;
                if field >= fields.len() {
                    return Err(bad("#", format!("field {field} out of range")));
                }
                let end = (field + count).min(fields.len());
                fields.drain(field..end);
            }
            other => return Err(EngineError::UpdateOp(format!("unknown op '{other}'"))),
        }
    }
    Ok(Tuple::new(fields))
}

fn arith(op: &str, current: &Value, arg: &Value) -> Result<Value, EngineError> {
    let a = current
        .as_i64()
        .ok_or_else(|| bad(op, "field is not an integer"))?;
    let b = arg
        .as_i64()
        .ok_or_else(|| bad(op, "argument is not an integer"))?;
    let result = if op == "+" {
        a.checked_add(b)
    } else {
        a.checked_sub(b)
    }
    .ok_or_else(|| bad(op, "integer overflow"))?;
    if result >= 0 {
        Ok(Value::from(result as u64))
    } else {
        Ok(Value::from(result))
    }
}
