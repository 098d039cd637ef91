use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use rmpv::Value;

use kestrel_common::error::IndexError;

/// An immutable tuple: a msgpack array of fields. Cloning is cheap; the
/// encoded bytes and the decoded fields are shared behind one `Arc`.
#[derive(Clone)]
pub struct Tuple {
    inner: Arc<TupleInner>,
}

struct TupleInner {
    data: Vec<u8>,
    fields: Vec<Value>,
}

impl Tuple {
    /// Build a tuple from decoded fields, encoding them once.
    pub fn new(fields: Vec<Value>) -> Tuple {
        let mut data = Vec::with_capacity(16 + fields.len() * 8);
        rmpv::encode::write_value(&mut data, &Value::Array(fields.clone()))
            .expect("write to Vec");
        Tuple {
            inner: Arc::new(TupleInner { data, fields }),
        }
    }

    /// Build a tuple from raw msgpack bytes; must decode to an array.
    pub fn from_bytes(data: Vec<u8>) -> Result<Tuple, IndexError> {
        let mut cur = Cursor::new(data.as_slice());
        let value = rmpv::decode::read_value(&mut cur).map_err(|_| IndexError::FieldType {
            field_no: 0,
            expected: "msgpack array",
        })?;
        let fields = match value {
            Value::Array(fields) => fields,
            _ => {
                return Err(IndexError::FieldType {
                    field_no: 0,
                    expected: "msgpack array",
                })
            }
        };
        Ok(Tuple {
            inner: Arc::new(TupleInner { data, fields }),
        })
    }

    pub fn field(&self, i: usize) -> Option<&Value> {
        self.inner.fields.get(i)
    }

    pub fn field_count(&self) -> usize {
        self.inner.fields.len()
    }

    pub fn fields(&self) -> &[Value] {
        &self.inner.fields
    }

    /// The raw msgpack encoding, reused verbatim by the wire and the WAL.
    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.inner.data == other.inner.data
    }
}

impl Eq for Tuple {}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tuple{:?}", self.inner.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_and_from_bytes_agree() {
        let t = Tuple::new(vec![Value::from(1u64), Value::from("a")]);
        let t2 = Tuple::from_bytes(t.data().to_vec()).unwrap();
        assert_eq!(t, t2);
        assert_eq!(t2.field(0), Some(&Value::from(1u64)));
        assert_eq!(t2.field_count(), 2);
    }

    #[test]
    fn non_array_bytes_rejected() {
        let mut data = Vec::new();
        rmpv::encode::write_value(&mut data, &Value::from(7u64)).unwrap();
        assert!(Tuple::from_bytes(data).is_err());
    }
}
