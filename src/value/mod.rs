use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{FieldPath, Timestamp};

/// A single Firestore-style field value.
///
/// Values of different types carry a total order (type rank first, then value)
/// so they can participate in orderBy comparisons and in the order-preserving
/// byte encoding the index manager builds sort keys from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(Vec<u8>),
    Reference(String),
    Array(Vec<FieldValue>),
    Map(ObjectValue),
}

impl FieldValue {
    pub fn type_rank(&self) -> u8 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Boolean(_) => 1,
            FieldValue::Integer(_) | FieldValue::Double(_) => 2,
            FieldValue::Timestamp(_) => 3,
            FieldValue::String(_) => 4,
            FieldValue::Bytes(_) => 5,
            FieldValue::Reference(_) => 6,
            FieldValue::Array(_) => 7,
            FieldValue::Map(_) => 8,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_array(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Total order across all value types: rank first, then value. Integers
    /// and doubles compare numerically within the shared number rank.
    pub fn compare(&self, other: &FieldValue) -> Ordering {
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => Ordering::Equal,
            (FieldValue::Boolean(a), FieldValue::Boolean(b)) => a.cmp(b),
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a.cmp(b),
            (FieldValue::Double(a), FieldValue::Double(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (FieldValue::Integer(a), FieldValue::Double(b)) => {
                (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (FieldValue::Double(a), FieldValue::Integer(b)) => {
                a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
            }
            (FieldValue::Timestamp(a), FieldValue::Timestamp(b)) => a.cmp(b),
            (FieldValue::String(a), FieldValue::String(b)) => a.cmp(b),
            (FieldValue::Bytes(a), FieldValue::Bytes(b)) => a.cmp(b),
            (FieldValue::Reference(a), FieldValue::Reference(b)) => a.cmp(b),
            (FieldValue::Array(a), FieldValue::Array(b)) => {
                for (left, right) in a.iter().zip(b.iter()) {
                    let ordering = left.compare(right);
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                a.len().cmp(&b.len())
            }
            (FieldValue::Map(a), FieldValue::Map(b)) => a.compare(b),
            _ => Ordering::Equal,
        }
    }

    pub fn array_contains(&self, needle: &FieldValue) -> bool {
        self.as_array()
            .map(|values| values.iter().any(|candidate| candidate == needle))
            .unwrap_or(false)
    }
}

/// A map of field names to values, the payload of every document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectValue {
    fields: BTreeMap<String, FieldValue>,
}

impl ObjectValue {
    pub fn new(fields: BTreeMap<String, FieldValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FieldValue> {
        let mut segments = path.segments().iter();
        let first = segments.next()?;
        let mut current = self.fields.get(first)?;
        for segment in segments {
            match current {
                FieldValue::Map(map) => {
                    current = map.fields.get(segment)?;
                }
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn set(&mut self, path: &FieldPath, value: FieldValue) {
        set_at_segments(&mut self.fields, path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        delete_at_segments(&mut self.fields, path.segments());
    }

    pub fn compare(&self, other: &ObjectValue) -> Ordering {
        let mut left = self.fields.iter();
        let mut right = other.fields.iter();
        loop {
            match (left.next(), right.next()) {
                (Some((lk, lv)), Some((rk, rv))) => {
                    let key_order = lk.cmp(rk);
                    if key_order != Ordering::Equal {
                        return key_order;
                    }
                    let value_order = lv.compare(rv);
                    if value_order != Ordering::Equal {
                        return value_order;
                    }
                }
                (Some(_), None) => return Ordering::Greater,
                (None, Some(_)) => return Ordering::Less,
                (None, None) => return Ordering::Equal,
            }
        }
    }
}

fn set_at_segments(fields: &mut BTreeMap<String, FieldValue>, segments: &[String], value: FieldValue) {
    match segments {
        [] => {}
        [last] => {
            fields.insert(last.clone(), value);
        }
        [first, rest @ ..] => {
            let entry = fields
                .entry(first.clone())
                .or_insert_with(|| FieldValue::Map(ObjectValue::empty()));
            if !matches!(entry, FieldValue::Map(_)) {
                *entry = FieldValue::Map(ObjectValue::empty());
            }
            if let FieldValue::Map(map) = entry {
                set_at_segments(&mut map.fields, rest, value);
            }
        }
    }
}

fn delete_at_segments(fields: &mut BTreeMap<String, FieldValue>, segments: &[String]) {
    match segments {
        [] => {}
        [last] => {
            fields.remove(last);
        }
        [first, rest @ ..] => {
            if let Some(FieldValue::Map(map)) = fields.get_mut(first) {
                delete_at_segments(&mut map.fields, rest);
            }
        }
    }
}

/// Convenience constructor for test and demo data.
pub fn object_from_pairs<I, S>(pairs: I) -> ObjectValue
where
    I: IntoIterator<Item = (S, FieldValue)>,
    S: Into<String>,
{
    ObjectValue::new(
        pairs
            .into_iter()
            .map(|(name, value)| (name.into(), value))
            .collect(),
    )
}
