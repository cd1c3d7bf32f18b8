//! [`RouteTable`] – URI pattern → handler for the web bridge.
//!
//! Patterns are `/`-separated segments; a `<name>` segment matches any one
//! path segment and binds it, percent-decoded, as a positional argument.
//! A pattern matches when it matches a prefix of the request path; the
//! longest matching pattern wins (more literal segments break ties, then
//! registration order).

use serde_json::Value;
use switchboard_types::{Args, BridgeError, ResponseDescriptor};
use tracing::info;

use crate::handler::Handler;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect()
}

#[derive(Clone)]
pub(crate) struct RouteEntry {
    pub pattern: String,
    segments: Vec<Segment>,
    pub handler_name: String,
    pub owner: Option<String>,
    pub handler: Handler,
}

impl RouteEntry {
    fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    /// Bound arguments when this route matches `path`.
    fn bind(&self, path: &[&str]) -> Option<Args> {
        if self.segments.len() > path.len() {
            return None;
        }
        let mut args = Args::new();
        for (segment, part) in self.segments.iter().zip(path) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) => {
                    let decoded = urlencoding::decode(part)
                        .map(|s| s.into_owned())
                        .unwrap_or_else(|_| (*part).to_string());
                    args.push(Value::String(decoded));
                }
            }
        }
        Some(args)
    }
}

/// A resolved route.
#[derive(Clone)]
pub struct RouteMatch {
    pub pattern: String,
    pub handler_name: String,
    pub handler: Handler,
    pub args: Args,
}

#[derive(Default, Clone)]
pub struct RouteTable {
    routes: Vec<RouteEntry>,
}

impl RouteTable {
    pub(crate) fn add(&mut self, pattern: &str, handler_name: &str, owner: Option<&str>, handler: Handler) {
        self.routes.push(RouteEntry {
            pattern: pattern.to_string(),
            segments: parse_pattern(pattern),
            handler_name: handler_name.to_string(),
            owner: owner.map(str::to_string),
            handler,
        });
        info!(route = pattern, handler = handler_name, "added route");
    }

    pub(crate) fn remove(&mut self, pattern: &str) -> Result<(), BridgeError> {
        let position = self
            .routes
            .iter()
            .position(|r| r.pattern == pattern)
            .ok_or_else(|| BridgeError::HandlerNotFound(format!("route {pattern}")))?;
        self.routes.remove(position);
        info!(route = pattern, "removed route");
        Ok(())
    }

    pub(crate) fn remove_owned(&mut self, owner: &str) -> usize {
        let before = self.routes.len();
        self.routes.retain(|r| r.owner.as_deref() != Some(owner));
        before - self.routes.len()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn patterns(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.pattern.as_str()).collect()
    }

    /// Resolve a request path (query string already stripped).
    pub fn resolve(&self, path: &str) -> Option<RouteMatch> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut best: Option<(&RouteEntry, Args)> = None;
        for route in &self.routes {
            let Some(args) = route.bind(&parts) else { continue };
            let better = match &best {
                None => true,
                Some((current, _)) => {
                    (route.segments.len(), route.literal_count())
                        > (current.segments.len(), current.literal_count())
                }
            };
            if better {
                best = Some((route, args));
            }
        }
        best.map(|(route, args)| RouteMatch {
            pattern: route.pattern.clone(),
            handler_name: route.handler_name.clone(),
            handler: route.handler.clone(),
            args,
        })
    }
}

/// Turn a route handler's return value into a response descriptor.
///
/// * an object that parses as a descriptor of a known kind is used as is,
/// * a string becomes `text`,
/// * `null` becomes `empty`,
/// * anything else becomes `json`.
pub fn into_descriptor(value: Value) -> ResponseDescriptor {
    match value {
        Value::Null => ResponseDescriptor::empty(),
        Value::String(text) => ResponseDescriptor::text(text),
        Value::Object(map) if map.contains_key("type") => {
            let value = Value::Object(map);
            match serde_json::from_value::<ResponseDescriptor>(value.clone()) {
                Ok(descriptor)
                    if matches!(
                        descriptor.kind.as_str(),
                        "text" | "html" | "json" | "redirect" | "empty"
                    ) =>
                {
                    descriptor
                }
                _ => ResponseDescriptor::json(value),
            }
        }
        other => ResponseDescriptor::json(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler;
    use serde_json::json;

    fn table() -> RouteTable {
        let noop = || handler(|_, _| async { Ok(Value::Null) });
        let mut table = RouteTable::default();
        table.add("/", "index", None, noop());
        table.add("/api/user/<id>", "user", None, noop());
        table.add("/api/user/me", "me", None, noop());
        table.add("/api/<section>/<item>", "generic", None, noop());
        table
    }

    #[test]
    fn longest_pattern_wins() {
        let table = table();
        assert_eq!(table.resolve("/api/user/7").unwrap().handler_name, "user");
        assert_eq!(table.resolve("/api/user/me").unwrap().handler_name, "me");
        assert_eq!(table.resolve("/api/news/1").unwrap().handler_name, "generic");
        assert_eq!(table.resolve("/about").unwrap().handler_name, "index");
    }

    #[test]
    fn params_are_percent_decoded() {
        let m = table().resolve("/api/user/hello%20world").unwrap();
        assert_eq!(m.args, vec![json!("hello world")]);
    }

    #[test]
    fn prefix_match_ignores_trailing_segments() {
        let m = table().resolve("/api/user/7/avatar").unwrap();
        assert_eq!(m.handler_name, "user");
        assert_eq!(m.args, vec![json!("7")]);
    }

    #[test]
    fn resolution_is_idempotent() {
        let table = table();
        let a = table.resolve("/api/news/42").unwrap();
        let b = table.resolve("/api/news/42").unwrap();
        assert_eq!(a.handler_name, b.handler_name);
        assert_eq!(a.args, b.args);
    }

    #[test]
    fn no_route_without_root() {
        let mut table = RouteTable::default();
        table.add("/api", "api", None, handler(|_, _| async { Ok(Value::Null) }));
        assert!(table.resolve("/other").is_none());
        assert!(table.remove("/missing").is_err());
        assert!(table.remove("/api").is_ok());
        assert!(table.is_empty());
    }

    #[test]
    fn descriptor_conversion() {
        assert_eq!(into_descriptor(Value::Null).kind, "empty");
        assert_eq!(into_descriptor(json!("hi")), ResponseDescriptor::text("hi"));
        let explicit = serde_json::to_value(ResponseDescriptor::html("<b>x</b>").with_status(201)).unwrap();
        let d = into_descriptor(explicit);
        assert_eq!(d.kind, "html");
        assert_eq!(d.status(), Some(201));
        let d = into_descriptor(json!({"type": "fruit", "name": "apple"}));
        assert_eq!(d.kind, "json");
        assert_eq!(d.args[0]["name"], json!("apple"));
    }
}
