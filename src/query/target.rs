use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::query::filter::{FieldFilter, Filter};
use crate::value::FieldValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    field: FieldPath,
    direction: OrderDirection,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: OrderDirection) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, OrderDirection::Ascending)
    }

    pub fn descending(field: FieldPath) -> Self {
        Self::new(field, OrderDirection::Descending)
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }
}

/// Cursor bound over the normalized orderBy of a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    position: Vec<FieldValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FieldValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub fn position(&self) -> &[FieldValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to_document(&self, order_by: &[OrderBy], doc: &MutableDocument) -> Ordering {
        for (index, order) in order_by.iter().enumerate() {
            if index >= self.position.len() {
                break;
            }
            let bound_value = &self.position[index];
            let doc_value = if order.field().is_document_id() {
                FieldValue::Reference(doc.key().path().canonical_string())
            } else {
                doc.data()
                    .field(order.field())
                    .cloned()
                    .unwrap_or(FieldValue::Null)
            };
            let mut ordering = bound_value.compare(&doc_value);
            if order.direction() == OrderDirection::Descending {
                ordering = ordering.reverse();
            }
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, doc);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    pub fn sorts_after_document(&self, order_by: &[OrderBy], doc: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, doc);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// A user query: a path or collection group, a filter tree, ordering, and
/// optional limit and cursor bounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<i32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    pub fn collection(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        Self {
            path: ResourcePath::root(),
            collection_group: Some(collection_id.into()),
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn with_start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn with_end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<i32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        self.path.len() % 2 == 0
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    /// The first inequality field, if any. Firestore requires at most one
    /// field with inequality filters per query.
    pub fn inequality_field(&self) -> Option<&FieldPath> {
        self.filters
            .iter()
            .flat_map(|filter| filter.flattened())
            .find(|filter| filter.op().is_inequality())
            .map(FieldFilter::field)
    }

    /// Complete ordering: explicit orderBy, then the inequality field when it
    /// is not already present, then the document-key tiebreak.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        if order_by.is_empty() {
            if let Some(field) = self.inequality_field() {
                if !field.is_document_id() {
                    order_by.push(OrderBy::ascending(field.clone()));
                }
            }
        }
        let has_key_order = order_by
            .iter()
            .any(|order| order.field().is_document_id());
        if !has_key_order {
            let direction = order_by
                .last()
                .map(OrderBy::direction)
                .unwrap_or(OrderDirection::Ascending);
            order_by.push(OrderBy::new(FieldPath::document_id(), direction));
        }
        order_by
    }

    pub fn matches(&self, doc: &MutableDocument) -> bool {
        doc.is_found_document()
            && self.matches_path(doc.key())
            && self.matches_order_by(doc)
            && self.matches_filters(doc)
            && self.matches_bounds(doc)
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        match &self.collection_group {
            Some(group) => {
                key.has_collection_id(group) && self.path.is_prefix_of(key.path())
            }
            None => {
                if self.path.len() % 2 == 0 {
                    key.path() == &self.path
                } else {
                    &key.collection_path() == &self.path
                }
            }
        }
    }

    /// A document matching an explicit orderBy must have that field present.
    fn matches_order_by(&self, doc: &MutableDocument) -> bool {
        self.explicit_order_by.iter().all(|order| {
            order.field().is_document_id() || doc.data().field(order.field()).is_some()
        })
    }

    fn matches_filters(&self, doc: &MutableDocument) -> bool {
        self.filters.iter().all(|filter| filter.matches(doc.data()))
    }

    fn matches_bounds(&self, doc: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(bound) = &self.start_at {
            if !bound.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        if let Some(bound) = &self.end_at {
            if !bound.sorts_after_document(&order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Comparator over documents in this query's result order, with the
    /// document-key tiebreak guaranteed by `normalized_order_by`.
    pub fn compare_documents(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = if order.field().is_document_id() {
                left.key().cmp(right.key())
            } else {
                let left_value = left
                    .data()
                    .field(order.field())
                    .cloned()
                    .unwrap_or(FieldValue::Null);
                let right_value = right
                    .data()
                    .field(order.field())
                    .cloned()
                    .unwrap_or(FieldValue::Null);
                left_value.compare(&right_value)
            };
            let ordering = match order.direction() {
                OrderDirection::Ascending => ordering,
                OrderDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Stable identifier used to detect equivalent queries and re-use
    /// persisted targets across restarts.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in self.normalized_order_by() {
            id.push_str(&order.field().canonical_string());
            id.push_str(match order.direction() {
                OrderDirection::Ascending => "asc",
                OrderDirection::Descending => "desc",
            });
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!(
                "|l:{limit}{}",
                match self.limit_type {
                    LimitType::First => "f",
                    LimitType::Last => "l",
                }
            ));
        }
        if let Some(bound) = &self.start_at {
            id.push_str(&format!("|sa:{}{:?}", bound.inclusive(), bound.position()));
        }
        if let Some(bound) = &self.end_at {
            id.push_str(&format!("|ea:{}{:?}", bound.inclusive(), bound.position()));
        }
        id
    }

    /// The server-facing representation of this query.
    pub fn to_target(&self) -> Target {
        Target {
            query: self.clone(),
        }
    }
}

/// A server-tracked subscription shape. Limbo resolution uses single-document
/// targets built straight from a key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    query: Query,
}

impl Target {
    pub fn for_document(key: &DocumentKey) -> Self {
        Target {
            query: Query::collection(key.path().clone()),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn canonical_id(&self) -> String {
        self.query.canonical_id()
    }

    pub fn is_document_target(&self) -> bool {
        self.query.is_document_query()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SnapshotVersion, Timestamp};
    use crate::query::filter::FilterOperator;
    use crate::value::{object_from_pairs, ObjectValue};

    fn doc(path: &str, fields: ObjectValue) -> MutableDocument {
        MutableDocument::found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            fields,
        )
    }

    fn field(s: &str) -> FieldPath {
        FieldPath::from_dot_separated(s).unwrap()
    }

    #[test]
    fn collection_query_matches_direct_children_only() {
        let query = Query::collection(ResourcePath::from_string("cities").unwrap());
        assert!(query.matches(&doc("cities/sf", ObjectValue::empty())));
        assert!(!query.matches(&doc("cities/sf/districts/soma", ObjectValue::empty())));
        assert!(!query.matches(&doc("states/ca", ObjectValue::empty())));
    }

    #[test]
    fn collection_group_query_matches_any_parent() {
        let query = Query::collection_group("districts");
        assert!(query.matches(&doc("cities/sf/districts/soma", ObjectValue::empty())));
        assert!(query.matches(&doc("districts/soma", ObjectValue::empty())));
        assert!(!query.matches(&doc("cities/sf", ObjectValue::empty())));
    }

    #[test]
    fn order_by_requires_field_presence() {
        let query = Query::collection(ResourcePath::from_string("cities").unwrap())
            .with_order_by(OrderBy::ascending(field("population")));
        assert!(query.matches(&doc(
            "cities/sf",
            object_from_pairs([("population", FieldValue::Integer(100))])
        )));
        assert!(!query.matches(&doc("cities/la", ObjectValue::empty())));
    }

    #[test]
    fn normalized_order_appends_key_tiebreak() {
        let query = Query::collection(ResourcePath::from_string("cities").unwrap())
            .with_order_by(OrderBy::descending(field("population")));
        let order_by = query.normalized_order_by();
        assert_eq!(order_by.len(), 2);
        assert!(order_by[1].field().is_document_id());
        assert_eq!(order_by[1].direction(), OrderDirection::Descending);
    }

    #[test]
    fn comparator_orders_by_field_then_key() {
        let query = Query::collection(ResourcePath::from_string("cities").unwrap())
            .with_order_by(OrderBy::descending(field("score")));
        let a = doc("cities/a", object_from_pairs([("score", FieldValue::Integer(10))]));
        let b = doc("cities/b", object_from_pairs([("score", FieldValue::Integer(8))]));
        assert_eq!(query.compare_documents(&a, &b), Ordering::Less);

        // The key tiebreak follows the last explicit orderBy's direction,
        // so under a descending sort the larger key sorts first.
        let c = doc("cities/c", object_from_pairs([("score", FieldValue::Integer(8))]));
        assert_eq!(query.compare_documents(&c, &b), Ordering::Less);
    }

    #[test]
    fn canonical_id_is_stable_for_equivalent_queries() {
        let build = || {
            Query::collection(ResourcePath::from_string("cities").unwrap())
                .with_filter(Filter::field(
                    field("state"),
                    FilterOperator::Equal,
                    FieldValue::String("CA".into()),
                ))
                .with_limit_to_first(10)
        };
        assert_eq!(build().canonical_id(), build().canonical_id());
        assert_ne!(
            build().canonical_id(),
            build().with_limit_to_first(20).canonical_id()
        );
    }
}
