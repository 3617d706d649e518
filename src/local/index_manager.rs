use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::local::persistence::PersistenceTransaction;
use crate::local::remote_document_cache::IndexOffset;
use crate::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::query::{FieldFilter, FilterOperator, OrderBy, OrderDirection, Query};
use crate::value::FieldValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexKind {
    Ascending,
    Descending,
    Contains,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: IndexKind) -> Self {
        Self { field_path, kind }
    }
}

/// How far an index has been populated, for incremental maintenance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexState {
    pub sequence_number: i64,
    pub offset: IndexOffset,
}

impl IndexState {
    pub fn empty() -> Self {
        Self {
            sequence_number: 0,
            offset: IndexOffset::none(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
    pub state: IndexState,
}

impl FieldIndex {
    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments
            .iter()
            .find(|segment| segment.kind == IndexKind::Contains)
    }

    pub fn directional_segments(&self) -> Vec<&IndexSegment> {
        self.segments
            .iter()
            .filter(|segment| segment.kind != IndexKind::Contains)
            .collect()
    }
}

/// How completely an index can answer a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexType {
    None,
    Partial,
    Full,
}

// Type tags follow the cross-type value ordering. Nonzero so encoded values
// never begin with the 0x00 terminator byte.
const TAG_NULL: u8 = 5;
const TAG_BOOLEAN: u8 = 10;
const TAG_NAN: u8 = 13;
const TAG_NUMBER: u8 = 15;
const TAG_TIMESTAMP: u8 = 20;
const TAG_STRING: u8 = 25;
const TAG_BYTES: u8 = 30;
const TAG_REFERENCE: u8 = 35;
const TAG_ARRAY: u8 = 50;
const TAG_MAP: u8 = 55;
const TERMINATOR: u8 = 0;

fn encode_ordered_double(out: &mut Vec<u8>, value: f64) {
    let bits = value.to_bits();
    let ordered = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits ^ (1 << 63)
    };
    out.extend_from_slice(&ordered.to_be_bytes());
}

fn encode_ordered_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&((value as u64) ^ (1 << 63)).to_be_bytes());
}

// 0x00 bytes are escaped as 0x00 0xFF so the bare 0x00 0x01 terminator
// sorts below any continuation, keeping prefixes ordered first.
fn encode_escaped_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    for byte in bytes {
        if *byte == 0 {
            out.push(0);
            out.push(0xFF);
        } else {
            out.push(*byte);
        }
    }
    out.push(0);
    out.push(1);
}

/// Order-preserving encoding: for any two values,
/// `encode(a) < encode(b)` iff `a.compare(&b) == Less`.
pub fn encode_index_value(value: &FieldValue, out: &mut Vec<u8>) {
    match value {
        FieldValue::Null => out.push(TAG_NULL),
        FieldValue::Boolean(b) => {
            out.push(TAG_BOOLEAN);
            out.push(*b as u8);
        }
        FieldValue::Integer(i) => {
            out.push(TAG_NUMBER);
            encode_ordered_double(out, *i as f64);
        }
        FieldValue::Double(d) => {
            if d.is_nan() {
                out.push(TAG_NAN);
            } else {
                out.push(TAG_NUMBER);
                encode_ordered_double(out, *d);
            }
        }
        FieldValue::Timestamp(ts) => {
            out.push(TAG_TIMESTAMP);
            encode_ordered_i64(out, ts.seconds);
            out.extend_from_slice(&(ts.nanos as u32).to_be_bytes());
        }
        FieldValue::String(s) => {
            out.push(TAG_STRING);
            encode_escaped_bytes(out, s.as_bytes());
        }
        FieldValue::Bytes(b) => {
            out.push(TAG_BYTES);
            encode_escaped_bytes(out, b);
        }
        FieldValue::Reference(path) => {
            out.push(TAG_REFERENCE);
            encode_escaped_bytes(out, path.as_bytes());
        }
        FieldValue::Array(values) => {
            out.push(TAG_ARRAY);
            for value in values {
                encode_index_value(value, out);
            }
            out.push(TERMINATOR);
        }
        FieldValue::Map(object) => {
            out.push(TAG_MAP);
            for (key, value) in object.fields() {
                encode_escaped_bytes(out, key.as_bytes());
                encode_index_value(value, out);
            }
            out.push(TERMINATOR);
        }
    }
}

fn encode_directional(value: &FieldValue, kind: IndexKind) -> Vec<u8> {
    let mut bytes = Vec::new();
    encode_index_value(value, &mut bytes);
    if kind == IndexKind::Descending {
        for byte in bytes.iter_mut() {
            *byte = !*byte;
        }
    }
    bytes
}

/// Smallest byte string strictly greater than every string prefixed by
/// `bytes`, or `None` when unbounded.
fn prefix_successor(mut bytes: Vec<u8>) -> Option<Vec<u8>> {
    while let Some(last) = bytes.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(bytes);
        }
        bytes.pop();
    }
    None
}

/// Half-open byte range over directional values, inclusive lower bound.
#[derive(Clone, Debug)]
struct ByteRange {
    lower: Vec<u8>,
    upper: Option<Vec<u8>>,
}

impl ByteRange {
    fn for_prefix(prefix: Vec<u8>) -> Self {
        let upper = prefix_successor(prefix.clone());
        Self {
            lower: prefix,
            upper,
        }
    }

    fn contains(&self, bytes: &[u8]) -> bool {
        bytes >= self.lower.as_slice()
            && self
                .upper
                .as_ref()
                .map(|upper| bytes < upper.as_slice())
                .unwrap_or(true)
    }
}

#[derive(Default)]
struct IndexManagerState {
    collection_parents: BTreeMap<String, BTreeSet<ResourcePath>>,
    indexes: BTreeMap<i32, FieldIndex>,
    next_index_id: i32,
    // (index id, array value, directional value, key) rows ordered for scans
    // plus a per-document view driving removal on updates.
    entries: BTreeSet<(i32, Vec<u8>, Vec<u8>, DocumentKey)>,
    entries_by_doc: BTreeMap<(i32, DocumentKey), BTreeSet<(Vec<u8>, Vec<u8>)>>,
}

/// Tracks collection parents and field indexes with their entry rows.
pub struct MemoryIndexManager {
    state: Mutex<IndexManagerState>,
}

impl MemoryIndexManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IndexManagerState::default()),
        }
    }

    pub fn add_to_collection_parent_index(
        &self,
        _txn: &PersistenceTransaction,
        collection_path: &ResourcePath,
    ) {
        let collection_id = match collection_path.last_segment() {
            Some(segment) => segment.to_string(),
            None => return,
        };
        let parent = collection_path.without_last();
        self.state
            .lock()
            .unwrap()
            .collection_parents
            .entry(collection_id)
            .or_default()
            .insert(parent);
    }

    pub fn get_collection_parents(&self, collection_id: &str) -> BTreeSet<ResourcePath> {
        self.state
            .lock()
            .unwrap()
            .collection_parents
            .get(collection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_field_index(
        &self,
        _txn: &PersistenceTransaction,
        collection_group: impl Into<String>,
        segments: Vec<IndexSegment>,
    ) -> i32 {
        let mut state = self.state.lock().unwrap();
        state.next_index_id += 1;
        let index_id = state.next_index_id;
        state.indexes.insert(
            index_id,
            FieldIndex {
                index_id,
                collection_group: collection_group.into(),
                segments,
                state: IndexState::empty(),
            },
        );
        index_id
    }

    pub fn delete_field_index(&self, _txn: &PersistenceTransaction, index_id: i32) {
        let mut state = self.state.lock().unwrap();
        state.indexes.remove(&index_id);
        state.entries.retain(|(id, _, _, _)| *id != index_id);
        state
            .entries_by_doc
            .retain(|(id, _), _| *id != index_id);
    }

    pub fn field_indexes_for_collection_group(&self, collection_group: &str) -> Vec<FieldIndex> {
        self.state
            .lock()
            .unwrap()
            .indexes
            .values()
            .filter(|index| index.collection_group == collection_group)
            .cloned()
            .collect()
    }

    pub fn set_index_state(
        &self,
        _txn: &PersistenceTransaction,
        index_id: i32,
        index_state: IndexState,
    ) {
        if let Some(index) = self.state.lock().unwrap().indexes.get_mut(&index_id) {
            index.state = index_state;
        }
    }

    /// Rebuilds the entry rows for each document against every index of its
    /// collection group.
    pub fn update_index_entries<'a>(
        &self,
        _txn: &PersistenceTransaction,
        docs: impl IntoIterator<Item = &'a MutableDocument>,
    ) {
        let mut state = self.state.lock().unwrap();
        for doc in docs {
            let group = doc.key().collection_group().to_string();
            let index_ids: Vec<i32> = state
                .indexes
                .values()
                .filter(|index| index.collection_group == group)
                .map(|index| index.index_id)
                .collect();
            for index_id in index_ids {
                let doc_slot = (index_id, doc.key().clone());
                if let Some(old_rows) = state.entries_by_doc.remove(&doc_slot) {
                    for (array_value, directional_value) in old_rows {
                        state.entries.remove(&(
                            index_id,
                            array_value,
                            directional_value,
                            doc.key().clone(),
                        ));
                    }
                }
                if !doc.is_found_document() {
                    continue;
                }
                let index = state.indexes.get(&index_id).cloned();
                let rows = index
                    .map(|index| entry_rows(&index, doc))
                    .unwrap_or_default();
                if rows.is_empty() {
                    continue;
                }
                for (array_value, directional_value) in &rows {
                    state.entries.insert((
                        index_id,
                        array_value.clone(),
                        directional_value.clone(),
                        doc.key().clone(),
                    ));
                }
                state
                    .entries_by_doc
                    .insert(doc_slot, rows.into_iter().collect());
            }
        }
    }

    /// Whether field indexes can answer `query` fully, partially, or not at
    /// all.
    pub fn get_index_type(&self, query: &Query) -> IndexType {
        let state = self.state.lock().unwrap();
        let terms = query_dnf_terms(query);
        let order_by = query.normalized_order_by();
        let mut result = IndexType::Full;
        for term in &terms {
            let best = state
                .indexes
                .values()
                .filter(|index| index.collection_group == query_collection_id(query))
                .map(|index| serves_term(index, term, &order_by))
                .max()
                .unwrap_or(IndexType::None);
            result = result.min(best);
            if result == IndexType::None {
                return IndexType::None;
            }
        }
        // A truncating query over multiple merged scans cannot be proven
        // complete from the index alone.
        if result == IndexType::Full && query.has_limit() && terms.len() > 1 {
            return IndexType::Partial;
        }
        result
    }

    /// Keys of documents the indexes report for `query`, or `None` when no
    /// usable index exists. The caller re-applies the query predicate.
    pub fn documents_matching_query(&self, query: &Query) -> Option<BTreeSet<DocumentKey>> {
        let state = self.state.lock().unwrap();
        let terms = query_dnf_terms(query);
        let order_by = query.normalized_order_by();
        let mut keys = BTreeSet::new();
        for term in &terms {
            let index = state
                .indexes
                .values()
                .filter(|index| index.collection_group == query_collection_id(query))
                .filter(|index| serves_term(index, term, &order_by) > IndexType::None)
                .max_by_key(|index| index.segments.len())?;
            let (array_points, ranges) = scan_ranges(index, term);
            for entry in state.entries.iter() {
                let (entry_index_id, array_value, directional_value, key) = entry;
                if *entry_index_id != index.index_id {
                    continue;
                }
                let array_ok = match &array_points {
                    Some(points) => points.iter().any(|point| point == array_value),
                    None => array_value.is_empty(),
                };
                if !array_ok {
                    continue;
                }
                if ranges.iter().any(|range| range.contains(directional_value)) {
                    keys.insert(key.clone());
                }
            }
        }
        Some(keys)
    }

    /// Builds an index shaped to serve `query` and returns its id. Entries
    /// are populated separately via `update_index_entries`.
    pub fn create_target_index(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
    ) -> Option<i32> {
        let mut segments = Vec::new();
        let mut seen = BTreeSet::new();
        for filter in flatten_field_filters(query) {
            let kind = match filter.op() {
                FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny => {
                    IndexKind::Contains
                }
                _ => IndexKind::Ascending,
            };
            if kind == IndexKind::Contains || filter.op() == FilterOperator::Equal
                || filter.op() == FilterOperator::In
            {
                if seen.insert((filter.field().clone(), kind)) {
                    segments.push(IndexSegment::new(filter.field().clone(), kind));
                }
            }
        }
        for order_by in query.normalized_order_by() {
            if order_by.field().is_document_id() {
                continue;
            }
            let kind = match order_by.direction() {
                OrderDirection::Ascending => IndexKind::Ascending,
                OrderDirection::Descending => IndexKind::Descending,
            };
            if seen
                .iter()
                .all(|(field, _)| field != order_by.field())
            {
                seen.insert((order_by.field().clone(), kind));
                segments.push(IndexSegment::new(order_by.field().clone(), kind));
            }
        }
        if segments.is_empty() {
            return None;
        }
        Some(self.add_field_index(txn, query_collection_id(query), segments))
    }
}

impl Default for MemoryIndexManager {
    fn default() -> Self {
        Self::new()
    }
}

fn query_collection_id(query: &Query) -> String {
    match query.collection_group_id() {
        Some(group) => group.to_string(),
        None => query
            .path()
            .last_segment()
            .unwrap_or_default()
            .to_string(),
    }
}

/// Conjunction of the query's filters, distributed into DNF terms.
fn query_dnf_terms(query: &Query) -> Vec<Vec<FieldFilter>> {
    let mut terms: Vec<Vec<FieldFilter>> = vec![Vec::new()];
    for filter in query.filters() {
        let filter_terms = filter.to_dnf_terms();
        let mut next = Vec::new();
        for existing in &terms {
            for filter_term in &filter_terms {
                let mut combined = existing.clone();
                combined.extend(filter_term.iter().cloned());
                next.push(combined);
            }
        }
        terms = next;
    }
    terms
}

fn flatten_field_filters(query: &Query) -> Vec<FieldFilter> {
    query
        .filters()
        .iter()
        .flat_map(|filter| filter.flattened())
        .cloned()
        .collect()
}

/// How well one index serves one DNF term with the query's ordering.
fn serves_term(index: &FieldIndex, term: &[FieldFilter], order_by: &[OrderBy]) -> IndexType {
    let array_filter = term.iter().find(|filter| filter.op().is_array_operator());
    match (array_filter, index.array_segment()) {
        (Some(filter), Some(segment)) => {
            if filter.field() != &segment.field_path {
                return IndexType::None;
            }
        }
        (Some(_), None) => return IndexType::None,
        (None, Some(_)) => return IndexType::None,
        (None, None) => {}
    }

    let equality_fields: BTreeSet<&FieldPath> = term
        .iter()
        .filter(|filter| {
            matches!(filter.op(), FilterOperator::Equal | FilterOperator::In)
        })
        .map(|filter| filter.field())
        .collect();

    let segments = index.directional_segments();
    let mut segment_index = 0;
    while segment_index < segments.len()
        && equality_fields.contains(&segments[segment_index].field_path)
    {
        segment_index += 1;
    }
    let matched_prefix = segment_index;

    // Remaining segments must mirror the ordering (the inequality field is
    // always the first ordered field).
    let mut full = true;
    for order in order_by {
        if order.field().is_document_id() {
            continue;
        }
        if equality_fields.contains(order.field()) {
            continue;
        }
        if segment_index >= segments.len() {
            full = false;
            break;
        }
        let segment = segments[segment_index];
        let direction_matches = match segment.kind {
            IndexKind::Ascending => order.direction() == OrderDirection::Ascending,
            IndexKind::Descending => order.direction() == OrderDirection::Descending,
            IndexKind::Contains => false,
        };
        if &segment.field_path != order.field() || !direction_matches {
            full = false;
            break;
        }
        segment_index += 1;
    }

    if full {
        // Every equality field must have been consumed by the prefix scan.
        let prefix_fields: BTreeSet<&FieldPath> = segments[..matched_prefix]
            .iter()
            .map(|segment| &segment.field_path)
            .collect();
        if equality_fields.iter().all(|field| prefix_fields.contains(*field)) {
            return IndexType::Full;
        }
    }
    if matched_prefix > 0 || array_filter.is_some() {
        IndexType::Partial
    } else {
        IndexType::None
    }
}

/// Byte ranges for one term against one index: array point values (if the
/// index carries a contains segment) and directional ranges with `in`
/// fan-out.
fn scan_ranges(
    index: &FieldIndex,
    term: &[FieldFilter],
) -> (Option<Vec<Vec<u8>>>, Vec<ByteRange>) {
    let array_points = index.array_segment().map(|segment| {
        let mut points = Vec::new();
        for filter in term {
            if filter.field() != &segment.field_path {
                continue;
            }
            match filter.op() {
                FilterOperator::ArrayContains => {
                    let mut bytes = Vec::new();
                    encode_index_value(filter.value(), &mut bytes);
                    points.push(bytes);
                }
                FilterOperator::ArrayContainsAny => {
                    if let Some(values) = filter.value().as_array() {
                        for value in values {
                            let mut bytes = Vec::new();
                            encode_index_value(value, &mut bytes);
                            points.push(bytes);
                        }
                    }
                }
                _ => {}
            }
        }
        points
    });

    let mut prefixes: Vec<Vec<u8>> = vec![Vec::new()];
    let mut ranges = Vec::new();
    let mut terminated = false;

    for segment in index.directional_segments() {
        let equalities: Vec<&FieldFilter> = term
            .iter()
            .filter(|filter| {
                filter.field() == &segment.field_path
                    && matches!(filter.op(), FilterOperator::Equal | FilterOperator::In)
            })
            .collect();
        if let Some(filter) = equalities.first() {
            let points: Vec<&FieldValue> = match filter.op() {
                FilterOperator::Equal => vec![filter.value()],
                FilterOperator::In => filter
                    .value()
                    .as_array()
                    .map(|values| values.iter().collect())
                    .unwrap_or_default(),
                _ => unreachable!(),
            };
            let mut next = Vec::new();
            for prefix in &prefixes {
                for point in &points {
                    let mut extended = prefix.clone();
                    extended.extend(encode_directional(point, segment.kind));
                    next.push(extended);
                }
            }
            prefixes = next;
            continue;
        }

        // First non-equality segment: bound it by the inequality filters and
        // stop extending.
        let (low, low_inclusive, high, high_inclusive) =
            value_bounds(term, &segment.field_path);
        for prefix in &prefixes {
            ranges.push(directional_range(
                prefix,
                segment.kind,
                low.as_ref(),
                low_inclusive,
                high.as_ref(),
                high_inclusive,
            ));
        }
        terminated = true;
        break;
    }

    if !terminated {
        for prefix in prefixes {
            ranges.push(ByteRange::for_prefix(prefix));
        }
    }
    (array_points, ranges)
}

/// Value-space bounds implied by the term's range filters on one field.
fn value_bounds(
    term: &[FieldFilter],
    field: &FieldPath,
) -> (Option<FieldValue>, bool, Option<FieldValue>, bool) {
    let mut low: Option<FieldValue> = None;
    let mut low_inclusive = true;
    let mut high: Option<FieldValue> = None;
    let mut high_inclusive = true;
    for filter in term {
        if filter.field() != field {
            continue;
        }
        match filter.op() {
            FilterOperator::GreaterThan => {
                if tighter_low(&low, filter.value(), false) {
                    low = Some(filter.value().clone());
                    low_inclusive = false;
                }
            }
            FilterOperator::GreaterThanOrEqual => {
                if tighter_low(&low, filter.value(), true) {
                    low = Some(filter.value().clone());
                    low_inclusive = true;
                }
            }
            FilterOperator::LessThan => {
                if tighter_high(&high, filter.value(), false) {
                    high = Some(filter.value().clone());
                    high_inclusive = false;
                }
            }
            FilterOperator::LessThanOrEqual => {
                if tighter_high(&high, filter.value(), true) {
                    high = Some(filter.value().clone());
                    high_inclusive = true;
                }
            }
            _ => {}
        }
    }
    (low, low_inclusive, high, high_inclusive)
}

fn tighter_low(current: &Option<FieldValue>, candidate: &FieldValue, _inclusive: bool) -> bool {
    match current {
        None => true,
        Some(existing) => candidate.compare(existing) == std::cmp::Ordering::Greater,
    }
}

fn tighter_high(current: &Option<FieldValue>, candidate: &FieldValue, _inclusive: bool) -> bool {
    match current {
        None => true,
        Some(existing) => candidate.compare(existing) == std::cmp::Ordering::Less,
    }
}

fn directional_range(
    prefix: &[u8],
    kind: IndexKind,
    low: Option<&FieldValue>,
    low_inclusive: bool,
    high: Option<&FieldValue>,
    high_inclusive: bool,
) -> ByteRange {
    // Descending segments invert byte order, so value-space bounds swap.
    let (byte_low, byte_low_inclusive, byte_high, byte_high_inclusive) =
        if kind == IndexKind::Descending {
            (high, high_inclusive, low, low_inclusive)
        } else {
            (low, low_inclusive, high, high_inclusive)
        };

    let lower = match byte_low {
        Some(value) => {
            let mut bytes = prefix.to_vec();
            bytes.extend(encode_directional(value, kind));
            if byte_low_inclusive {
                bytes
            } else {
                match prefix_successor(bytes) {
                    Some(succ) => succ,
                    None => return ByteRange {
                        lower: vec![0xFF],
                        upper: Some(vec![0xFF]),
                    },
                }
            }
        }
        None => prefix.to_vec(),
    };
    let upper = match byte_high {
        Some(value) => {
            let mut bytes = prefix.to_vec();
            bytes.extend(encode_directional(value, kind));
            if byte_high_inclusive {
                prefix_successor(bytes)
            } else {
                Some(bytes)
            }
        }
        None => prefix_successor(prefix.to_vec()),
    };
    ByteRange { lower, upper }
}

/// Entry rows for one document in one index: the cross product of array
/// elements (for a contains segment) with the concatenated directional
/// values. A document missing any indexed field produces no rows.
fn entry_rows(index: &FieldIndex, doc: &MutableDocument) -> Vec<(Vec<u8>, Vec<u8>)> {
    let array_values: Vec<Vec<u8>> = match index.array_segment() {
        Some(segment) => match doc.data().field(&segment.field_path) {
            Some(FieldValue::Array(values)) => values
                .iter()
                .map(|value| {
                    let mut bytes = Vec::new();
                    encode_index_value(value, &mut bytes);
                    bytes
                })
                .collect(),
            _ => return Vec::new(),
        },
        None => vec![Vec::new()],
    };

    let mut directional = Vec::new();
    for segment in index.directional_segments() {
        match doc.data().field(&segment.field_path) {
            Some(value) => directional.extend(encode_directional(value, segment.kind)),
            None => return Vec::new(),
        }
    }

    array_values
        .into_iter()
        .map(|array_value| (array_value, directional.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::persistence::MemoryPersistence;
    use crate::model::{SnapshotVersion, Timestamp};
    use crate::query::Filter;
    use crate::value::object_from_pairs;

    fn field(s: &str) -> FieldPath {
        FieldPath::from_dot_separated(s).unwrap()
    }

    fn doc(path: &str, pairs: Vec<(&str, FieldValue)>) -> MutableDocument {
        MutableDocument::found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            object_from_pairs(pairs),
        )
    }

    fn encode(value: &FieldValue) -> Vec<u8> {
        let mut out = Vec::new();
        encode_index_value(value, &mut out);
        out
    }

    #[test]
    fn encoding_preserves_value_order() {
        let values = [
            FieldValue::Null,
            FieldValue::Boolean(false),
            FieldValue::Boolean(true),
            FieldValue::Double(-1.5),
            FieldValue::Integer(0),
            FieldValue::Integer(7),
            FieldValue::Double(7.5),
            FieldValue::Timestamp(Timestamp::new(10, 0)),
            FieldValue::String("a".into()),
            FieldValue::String("ab".into()),
            FieldValue::String("b".into()),
            FieldValue::Bytes(vec![0, 1]),
            FieldValue::Array(vec![FieldValue::Integer(1)]),
        ];
        for window in values.windows(2) {
            assert!(
                encode(&window[0]) < encode(&window[1]),
                "{:?} should encode below {:?}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn string_prefix_sorts_before_extension() {
        let short = encode(&FieldValue::String("ab".into()));
        let long = encode(&FieldValue::String("ab\u{0}c".into()));
        assert!(short < long);
    }

    #[tokio::test]
    async fn equality_query_served_from_index() {
        let persistence = MemoryPersistence::new();
        let manager = MemoryIndexManager::new();
        persistence
            .run_transaction("index", |txn| {
                manager.add_field_index(
                    txn,
                    "cities",
                    vec![IndexSegment::new(field("state"), IndexKind::Ascending)],
                );
                manager.update_index_entries(
                    txn,
                    [
                        &doc("cities/sf", vec![("state", FieldValue::String("CA".into()))]),
                        &doc("cities/la", vec![("state", FieldValue::String("CA".into()))]),
                        &doc("cities/nyc", vec![("state", FieldValue::String("NY".into()))]),
                    ],
                );
                Ok(())
            })
            .await
            .unwrap();
        let query = Query::collection(ResourcePath::from_string("cities").unwrap()).with_filter(
            Filter::field(field("state"), FilterOperator::Equal, FieldValue::String("CA".into())),
        );
        assert_eq!(manager.get_index_type(&query), IndexType::Full);
        let keys = manager.documents_matching_query(&query).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&DocumentKey::from_string("cities/sf").unwrap()));
    }

    #[tokio::test]
    async fn inequality_range_scan() {
        let persistence = MemoryPersistence::new();
        let manager = MemoryIndexManager::new();
        persistence
            .run_transaction("index", |txn| {
                manager.add_field_index(
                    txn,
                    "cities",
                    vec![IndexSegment::new(field("population"), IndexKind::Ascending)],
                );
                manager.update_index_entries(
                    txn,
                    [
                        &doc("cities/a", vec![("population", FieldValue::Integer(10))]),
                        &doc("cities/b", vec![("population", FieldValue::Integer(20))]),
                        &doc("cities/c", vec![("population", FieldValue::Integer(30))]),
                    ],
                );
                Ok(())
            })
            .await
            .unwrap();
        let query = Query::collection(ResourcePath::from_string("cities").unwrap()).with_filter(
            Filter::field(
                field("population"),
                FilterOperator::GreaterThan,
                FieldValue::Integer(10),
            ),
        );
        let keys = manager.documents_matching_query(&query).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(!keys.contains(&DocumentKey::from_string("cities/a").unwrap()));
    }

    #[tokio::test]
    async fn array_contains_uses_contains_segment() {
        let persistence = MemoryPersistence::new();
        let manager = MemoryIndexManager::new();
        persistence
            .run_transaction("index", |txn| {
                manager.add_field_index(
                    txn,
                    "cities",
                    vec![IndexSegment::new(field("regions"), IndexKind::Contains)],
                );
                manager.update_index_entries(
                    txn,
                    [
                        &doc(
                            "cities/sf",
                            vec![(
                                "regions",
                                FieldValue::Array(vec![
                                    FieldValue::String("west".into()),
                                    FieldValue::String("coast".into()),
                                ]),
                            )],
                        ),
                        &doc(
                            "cities/phx",
                            vec![(
                                "regions",
                                FieldValue::Array(vec![FieldValue::String("west".into())]),
                            )],
                        ),
                    ],
                );
                Ok(())
            })
            .await
            .unwrap();
        let query = Query::collection(ResourcePath::from_string("cities").unwrap()).with_filter(
            Filter::field(
                field("regions"),
                FilterOperator::ArrayContains,
                FieldValue::String("coast".into()),
            ),
        );
        let keys = manager.documents_matching_query(&query).unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&DocumentKey::from_string("cities/sf").unwrap()));
    }

    #[tokio::test]
    async fn document_update_replaces_entries() {
        let persistence = MemoryPersistence::new();
        let manager = MemoryIndexManager::new();
        persistence
            .run_transaction("index", |txn| {
                manager.add_field_index(
                    txn,
                    "cities",
                    vec![IndexSegment::new(field("state"), IndexKind::Ascending)],
                );
                manager.update_index_entries(
                    txn,
                    [&doc("cities/sf", vec![("state", FieldValue::String("CA".into()))])],
                );
                manager.update_index_entries(
                    txn,
                    [&doc("cities/sf", vec![("state", FieldValue::String("WA".into()))])],
                );
                Ok(())
            })
            .await
            .unwrap();
        let ca_query = Query::collection(ResourcePath::from_string("cities").unwrap())
            .with_filter(Filter::field(
                field("state"),
                FilterOperator::Equal,
                FieldValue::String("CA".into()),
            ));
        assert!(manager.documents_matching_query(&ca_query).unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_index_reports_none() {
        let manager = MemoryIndexManager::new();
        let query = Query::collection(ResourcePath::from_string("cities").unwrap()).with_filter(
            Filter::field(field("state"), FilterOperator::Equal, FieldValue::String("CA".into())),
        );
        assert_eq!(manager.get_index_type(&query), IndexType::None);
        assert!(manager.documents_matching_query(&query).is_none());
    }

    #[tokio::test]
    async fn collection_parent_index() {
        let persistence = MemoryPersistence::new();
        let manager = MemoryIndexManager::new();
        persistence
            .run_transaction("parents", |txn| {
                manager.add_to_collection_parent_index(
                    txn,
                    &ResourcePath::from_string("cities").unwrap(),
                );
                manager.add_to_collection_parent_index(
                    txn,
                    &ResourcePath::from_string("cities/sf/districts").unwrap(),
                );
                Ok(())
            })
            .await
            .unwrap();
        let parents = manager.get_collection_parents("districts");
        assert_eq!(parents.len(), 1);
        assert!(parents.contains(&ResourcePath::from_string("cities/sf").unwrap()));
    }
}
