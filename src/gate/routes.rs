//! Upstream route matching.

use std::sync::Arc;

use crate::ratelimit::RateLimitOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder,
}

/// A parsed upstream path template such as `/api/users/{id}`.
///
/// `{name}` matches exactly one path segment, except in the last position
/// where it also matches the rest of the path (`/files/{everything}`).
/// Literal segments compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    template: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Parse a template.
    pub fn parse(template: &str) -> Self {
        let segments = split_path(template)
            .map(|segment| {
                if segment.starts_with('{') && segment.ends_with('}') && segment.len() > 2 {
                    Segment::Placeholder
                } else {
                    Segment::Literal(segment.to_lowercase())
                }
            })
            .collect();

        Self {
            template: template.to_string(),
            segments,
        }
    }

    /// The template as written in configuration.
    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Whether `path` matches this template.
    pub fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = split_path(path).collect();

        for (i, segment) in self.segments.iter().enumerate() {
            let last = i + 1 == self.segments.len();
            match segment {
                Segment::Placeholder if last => return parts.len() > i,
                Segment::Placeholder => {
                    if parts.get(i).is_none() {
                        return false;
                    }
                }
                Segment::Literal(literal) => match parts.get(i) {
                    Some(part) if part.eq_ignore_ascii_case(literal) => {}
                    _ => return false,
                },
            }
        }

        parts.len() == self.segments.len()
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// A configured upstream route with its merged rate limiting options.
#[derive(Debug, Clone)]
pub struct Route {
    /// Route key used by the global options' route groups
    pub key: Option<String>,
    /// Upstream path template
    pub template: PathTemplate,
    /// Accepted methods, upper-cased; empty accepts any method
    pub methods: Vec<String>,
    /// Merged rate limiting options
    pub options: Arc<RateLimitOptions>,
}

impl Route {
    /// Create a new route.
    pub fn new(
        template: &str,
        methods: impl IntoIterator<Item = impl AsRef<str>>,
        options: RateLimitOptions,
    ) -> Self {
        Self {
            key: None,
            template: PathTemplate::parse(template),
            methods: methods
                .into_iter()
                .map(|m| m.as_ref().to_uppercase())
                .collect(),
            options: Arc::new(options),
        }
    }

    /// Set the route key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    fn accepts(&self, path: &str, method: &str) -> bool {
        let method_ok = self.methods.is_empty()
            || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method));
        method_ok && self.template.matches(path)
    }
}

/// The route a request resolved to.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    /// Upstream path template of the route, used to name it in messages
    pub name: String,
    /// Rate limiting options of the route
    pub options: Arc<RateLimitOptions>,
}

/// The routing table; the first matching route wins.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Create a table from routes in priority order.
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Find the route for a request.
    pub fn resolve(&self, path: &str, method: &str) -> Option<ResolvedRoute> {
        self.routes
            .iter()
            .find(|route| route.accepts(path, method))
            .map(|route| ResolvedRoute {
                name: route.template.as_str().to_string(),
                options: route.options.clone(),
            })
    }
}
