use serde_json::Value;

/// How a query's matches should be ordered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Order {
    /// Earliest-inserted first, the way a hierarchical database's push-key
    /// ordering works.
    Insertion,
}

/// A backend-agnostic description of one of the two queries `TaskWorker`
/// needs: "the next eligible candidate" and "everything currently
/// in-progress".
///
/// A concrete `Backend` implementation turns this into whatever native query
/// mechanism it has (an RTDB `orderByChild().equalTo()`, a SQL `WHERE`
/// clause, ...).
#[derive(Clone, Debug, PartialEq)]
pub struct QueryDescriptor {
    /// The field being filtered on (always `"_state"` for this crate's two
    /// queries, but kept generic for forward-compatibility with a richer
    /// query surface).
    pub field: &'static str,

    /// The value `field` must equal. `None` matches records where `field` is
    /// absent entirely.
    pub equals: Option<Value>,

    pub order: Order,

    /// `Some(1)` for the "next candidate" query; `None` (unbounded) for the
    /// "all in-progress" query.
    pub limit: Option<u32>,
}

impl QueryDescriptor {
    pub fn matches(&self, state: Option<&str>) -> bool {
        match (&self.equals, state) {
            (None, None) => true,
            (Some(Value::String(expected)), Some(actual)) => expected == actual,
            _ => false,
        }
    }
}
