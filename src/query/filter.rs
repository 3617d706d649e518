use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::model::FieldPath;
use crate::value::FieldValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    In,
    ArrayContainsAny,
    NotIn,
}

impl FilterOperator {
    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    pub fn is_array_operator(&self) -> bool {
        matches!(
            self,
            FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::In => "in",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::NotIn => "not-in",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FieldValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FieldValue) -> Self {
        Self { field, op, value }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FieldValue {
        &self.value
    }

    pub fn matches_value(&self, value: Option<&FieldValue>) -> bool {
        let value = match value {
            Some(value) => value,
            // Missing fields only match explicit null inequality.
            None => {
                return match self.op {
                    FilterOperator::NotEqual => !self.value.is_null(),
                    _ => false,
                }
            }
        };

        match self.op {
            FilterOperator::Equal => value == &self.value,
            FilterOperator::NotEqual => {
                !value.is_null() && !self.value.is_null() && value != &self.value
            }
            FilterOperator::LessThan => {
                comparable(value, &self.value) && value.compare(&self.value) == Ordering::Less
            }
            FilterOperator::LessThanOrEqual => {
                comparable(value, &self.value) && value.compare(&self.value) != Ordering::Greater
            }
            FilterOperator::GreaterThan => {
                comparable(value, &self.value) && value.compare(&self.value) == Ordering::Greater
            }
            FilterOperator::GreaterThanOrEqual => {
                comparable(value, &self.value) && value.compare(&self.value) != Ordering::Less
            }
            FilterOperator::ArrayContains => value.array_contains(&self.value),
            FilterOperator::ArrayContainsAny => match self.value.as_array() {
                Some(needles) => needles.iter().any(|needle| value.array_contains(needle)),
                None => false,
            },
            FilterOperator::In => match self.value.as_array() {
                Some(values) => values.iter().any(|candidate| candidate == value),
                None => false,
            },
            FilterOperator::NotIn => match self.value.as_array() {
                Some(values) => {
                    !value.is_null() && values.iter().all(|candidate| candidate != value)
                }
                None => false,
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{:?}",
            self.field.canonical_string(),
            self.op.as_str(),
            self.value
        )
    }
}

/// Inequality filters only hold between values of the same type rank.
fn comparable(left: &FieldValue, right: &FieldValue) -> bool {
    left.type_rank() == right.type_rank()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompositeFilter {
    op: CompositeOperator,
    filters: Vec<Filter>,
}

impl CompositeFilter {
    pub fn new(op: CompositeOperator, filters: Vec<Filter>) -> Self {
        Self { op, filters }
    }

    pub fn op(&self) -> CompositeOperator {
        self.op
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn is_conjunction(&self) -> bool {
        self.op == CompositeOperator::And
    }

    pub fn is_flat_conjunction(&self) -> bool {
        self.is_conjunction()
            && self
                .filters
                .iter()
                .all(|filter| matches!(filter, Filter::Field(_)))
    }
}

/// Filter tree over a query, either a leaf field predicate or an And/Or node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Field(FieldFilter),
    Composite(CompositeFilter),
}

impl Filter {
    pub fn field(field: FieldPath, op: FilterOperator, value: FieldValue) -> Self {
        Filter::Field(FieldFilter::new(field, op, value))
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(CompositeOperator::And, filters))
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(CompositeOperator::Or, filters))
    }

    pub fn matches(&self, data: &crate::value::ObjectValue) -> bool {
        match self {
            Filter::Field(filter) => filter.matches_value(data.field(filter.field())),
            Filter::Composite(composite) => match composite.op() {
                CompositeOperator::And => composite
                    .filters()
                    .iter()
                    .all(|filter| filter.matches(data)),
                CompositeOperator::Or => composite
                    .filters()
                    .iter()
                    .any(|filter| filter.matches(data)),
            },
        }
    }

    /// Every leaf field filter in the tree, in order.
    pub fn flattened(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite(composite) => composite
                .filters()
                .iter()
                .flat_map(|filter| filter.flattened())
                .collect(),
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite(composite) => {
                let op = match composite.op() {
                    CompositeOperator::And => "and",
                    CompositeOperator::Or => "or",
                };
                let parts: Vec<String> = composite
                    .filters()
                    .iter()
                    .map(|filter| filter.canonical_id())
                    .collect();
                format!("{op}({})", parts.join(","))
            }
        }
    }

    /// Rewrites the tree into disjunctive normal form: an OR of flat AND
    /// terms. The result is the list of conjunctive terms; a fully
    /// conjunction-free filter yields a single term.
    pub fn to_dnf_terms(&self) -> Vec<Vec<FieldFilter>> {
        match self {
            Filter::Field(filter) => vec![vec![filter.clone()]],
            Filter::Composite(composite) => match composite.op() {
                CompositeOperator::Or => composite
                    .filters()
                    .iter()
                    .flat_map(|filter| filter.to_dnf_terms())
                    .collect(),
                CompositeOperator::And => {
                    let mut terms: Vec<Vec<FieldFilter>> = vec![Vec::new()];
                    for filter in composite.filters() {
                        let sub_terms = filter.to_dnf_terms();
                        let mut next = Vec::with_capacity(terms.len() * sub_terms.len());
                        for term in &terms {
                            for sub in &sub_terms {
                                let mut combined = term.clone();
                                combined.extend(sub.iter().cloned());
                                next.push(combined);
                            }
                        }
                        terms = next;
                    }
                    terms
                }
            },
        }
    }
}
