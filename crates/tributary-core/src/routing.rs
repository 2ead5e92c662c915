//! Event categories and the routing table that classifies events.
//!
//! A [`RoutingTable`] holds the closed set of categories this deployment
//! knows about. Each [`Route`] names the analytical table rows are appended
//! to and the payload field holding the category's business timestamp.
//!
//! Routes are configured as `category=table[@time_field]` strings:
//!
//! ```text
//! order=orders@order_date,inventory=inventory,user_activity=user_activity
//! ```
//!
//! Routes without an explicit `@time_field` use the table-wide default
//! (`timestamp` unless configured otherwise).

use crate::error::{Error, Result};
use crate::event::Event;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Field holding the business timestamp for categories that don't override it.
pub const DEFAULT_TIME_FIELD: &str = "timestamp";

/// Route specs used when none are configured.
pub const DEFAULT_ROUTES: &[&str] = &[
    "order=orders@order_date",
    "inventory=inventory",
    "user_activity=user_activity",
];

/// Archive category segment reserved for events no route accepts.
pub const UNROUTABLE_CATEGORY: &str = "_unroutable";

/// The business type of an event, as named by its `event_type` field.
///
/// A `Category` is only a name; whether it is routable is decided by the
/// [`RoutingTable`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Category(Arc<str>);

impl Category {
    /// Create a category from its name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The category name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the name is safe to use as an archive path segment.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Category({})", self.0)
    }
}

impl AsRef<str> for Category {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Where events of one category go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Category this route accepts.
    pub category: Category,

    /// Table identifier rows are appended to.
    pub table: String,

    /// Payload field holding the authoritative event time.
    pub time_field: String,
}

/// Why an event could not be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnroutableReason {
    /// The payload has no string `event_type` field.
    MissingEventType,
    /// The `event_type` names a category with no route.
    UnknownCategory(Category),
}

impl fmt::Display for UnroutableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingEventType => f.write_str("missing event_type"),
            Self::UnknownCategory(c) => write!(f, "unknown category '{}'", c),
        }
    }
}

/// Result of classifying a decoded event.
#[derive(Debug, Clone)]
pub enum Classification {
    /// The event belongs to a known category.
    Routed {
        /// The event.
        event: Event,
        /// Its route.
        route: Arc<Route>,
    },
    /// Structurally valid event with no matching route.
    Unroutable {
        /// The event.
        event: Event,
        /// Why no route matched.
        reason: UnroutableReason,
    },
}

/// Lookup table from category name to [`Route`].
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<String, Arc<Route>>,
    default_time_field: String,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::parse(DEFAULT_ROUTES.iter().copied(), DEFAULT_TIME_FIELD)
            .expect("default routes are valid")
    }
}

impl RoutingTable {
    /// Create an empty routing table.
    pub fn new(default_time_field: impl Into<String>) -> Self {
        Self {
            routes: HashMap::new(),
            default_time_field: default_time_field.into(),
        }
    }

    /// Build a table from `category=table[@time_field]` specs.
    pub fn parse<I, S>(specs: I, default_time_field: &str) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut table = Self::new(default_time_field);
        for spec in specs {
            let spec = spec.as_ref().trim();
            if spec.is_empty() {
                continue;
            }
            table.insert_spec(spec)?;
        }
        Ok(table)
    }

    fn insert_spec(&mut self, spec: &str) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidRoute {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let (category, rest) = spec
            .split_once('=')
            .ok_or_else(|| invalid("expected category=table[@time_field]"))?;
        let (table, time_field) = match rest.split_once('@') {
            Some((table, field)) => (table.trim(), Some(field.trim())),
            None => (rest.trim(), None),
        };

        let category = Category::new(category.trim());
        if category.as_str().is_empty() {
            return Err(invalid("empty category"));
        }
        if !category.is_path_safe() {
            return Err(invalid(
                "category may only contain ASCII letters, digits, '_' and '-'",
            ));
        }
        if category.as_str() == UNROUTABLE_CATEGORY {
            return Err(invalid("category name is reserved"));
        }
        if table.is_empty() {
            return Err(invalid("empty table"));
        }
        if time_field.is_some_and(str::is_empty) {
            return Err(invalid("empty time field"));
        }

        let route = Route {
            category: category.clone(),
            table: table.to_string(),
            time_field: time_field
                .map(str::to_string)
                .unwrap_or_else(|| self.default_time_field.clone()),
        };
        self.insert(route)
            .map_err(|_| invalid("duplicate category"))
    }

    /// Register a route. Fails if the category already has one.
    pub fn insert(&mut self, route: Route) -> Result<()> {
        let name = route.category.as_str().to_string();
        if self.routes.contains_key(&name) {
            return Err(Error::InvalidRoute {
                spec: name,
                reason: "duplicate category".to_string(),
            });
        }
        self.routes.insert(name, Arc::new(route));
        Ok(())
    }

    /// Look up the route for a category name.
    pub fn get(&self, category: &str) -> Option<&Arc<Route>> {
        self.routes.get(category)
    }

    /// Field name used for routes without an explicit time field.
    pub fn default_time_field(&self) -> &str {
        &self.default_time_field
    }

    /// All routes, sorted by category name.
    pub fn routes(&self) -> Vec<Arc<Route>> {
        let mut routes: Vec<_> = self.routes.values().cloned().collect();
        routes.sort_by(|a, b| a.category.cmp(&b.category));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Assign an event to its route, or mark it unroutable.
    pub fn classify(&self, event: Event) -> Classification {
        let Some(category) = event.category().cloned() else {
            return Classification::Unroutable {
                event,
                reason: UnroutableReason::MissingEventType,
            };
        };

        match self.routes.get(category.as_str()) {
            Some(route) => Classification::Routed {
                event,
                route: Arc::clone(route),
            },
            None => Classification::Unroutable {
                event,
                reason: UnroutableReason::UnknownCategory(category),
            },
        }
    }
}
