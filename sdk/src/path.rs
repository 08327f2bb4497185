//! Identity of a thing on the platform
use std::fmt;

/// Product and device identifiers of one thing
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThingPath {
    pub product_id: String,
    pub thing_id: String,
}

impl ThingPath {
    pub fn new(product_id: impl Into<String>, thing_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            thing_id: thing_id.into(),
        }
    }

    /// Build a topic under this thing, e.g. `/sys/{product}/{thing}/thing/event/post`
    pub fn topic(&self, prefix: &str, suffix: &str) -> String {
        format!("{prefix}/{}/{}/{suffix}", self.product_id, self.thing_id)
    }
}

impl fmt::Display for ThingPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.product_id, self.thing_id)
    }
}
