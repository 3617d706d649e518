mod filter;
mod target;

pub use filter::{CompositeFilter, CompositeOperator, FieldFilter, Filter, FilterOperator};
pub use target::{Bound, LimitType, OrderBy, OrderDirection, Query, Target};
