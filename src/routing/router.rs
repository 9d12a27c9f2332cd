//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Compile routers into an immutable, precedence-ordered table
//! - Look up the matching route for a request
//! - Return matched route or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(1) host lookup via HashMap, only host-agnostic routes scanned besides
//! - Path prefix pre-check before full rule evaluation
//! - Explicit NoMatch rather than silent default

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::dynamic::types::{EntityError, EntityKind, ResolvedRouter};
use crate::routing::matcher::{Matcher, RequestInfo};
use crate::routing::rule::Rule;

/// A router ready for per-request evaluation.
#[derive(Debug)]
pub struct CompiledRoute {
    /// Qualified router name.
    pub name: String,
    pub rule: Rule,
    pub rule_text: String,
    pub priority: i64,
    pub service: String,
    pub middlewares: Vec<String>,
    pub tls: bool,
    literal_length: usize,
    order: usize,
    path_hint: Option<String>,
}

impl CompiledRoute {
    fn precedence_key(&self) -> (Reverse<i64>, Reverse<usize>, usize) {
        (Reverse(self.priority), Reverse(self.literal_length), self.order)
    }

    fn matches(&self, req: &RequestInfo<'_>) -> bool {
        if let Some(prefix) = &self.path_hint {
            if !req.path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.rule.matches(req)
    }
}

/// Compiled, priority-ordered route table.
///
/// Routes are stored in precedence order, so a smaller index always wins.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<CompiledRoute>>,
    by_host: HashMap<String, Vec<usize>>,
    any_host: Vec<usize>,
}

impl RouteTable {
    /// Compile routers. Pure: never touches a live table.
    ///
    /// A router whose rule does not parse is excluded and reported; the rest
    /// still compile. `excluded` lists routers dropped by earlier build steps.
    pub fn compile(
        routers: &BTreeMap<String, ResolvedRouter>,
        excluded: &[String],
    ) -> (Self, Vec<EntityError>) {
        let mut errors = Vec::new();
        let mut routes = Vec::with_capacity(routers.len());

        for (order, (name, router)) in routers.iter().enumerate() {
            if excluded.contains(name) {
                continue;
            }
            let rule = match Rule::parse(&router.rule) {
                Ok(rule) => rule,
                Err(e) => {
                    tracing::warn!(router = %name, rule = %router.rule, error = %e, "Excluding router with invalid rule");
                    errors.push(EntityError::new(
                        EntityKind::Router,
                        name,
                        &router.source,
                        format!("invalid rule: {}", e),
                    ));
                    continue;
                }
            };

            routes.push(CompiledRoute {
                name: name.clone(),
                priority: router.priority.unwrap_or_else(|| rule.specificity()),
                literal_length: rule.literal_length(),
                path_hint: rule.required_path_prefix(),
                rule_text: router.rule.clone(),
                rule,
                service: router.service.clone(),
                middlewares: router.middlewares.clone(),
                tls: router.tls,
                order,
            });
        }

        routes.sort_by_key(|r| r.precedence_key());

        let mut by_host: HashMap<String, Vec<usize>> = HashMap::new();
        let mut any_host = Vec::new();
        for (idx, route) in routes.iter().enumerate() {
            match route.rule.required_hosts() {
                Some(hosts) => {
                    for host in hosts {
                        by_host.entry(host).or_default().push(idx);
                    }
                }
                None => any_host.push(idx),
            }
        }

        let table = Self {
            routes: routes.into_iter().map(Arc::new).collect(),
            by_host,
            any_host,
        };
        (table, errors)
    }

    /// Find the highest-precedence route matching the request.
    pub fn match_request(&self, req: &RequestInfo<'_>) -> Option<&Arc<CompiledRoute>> {
        let host_candidates: &[usize] = self
            .by_host
            .get(&req.host)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        // Both candidate lists are ascending; walk them as one merged sequence.
        let (mut i, mut j) = (0, 0);
        loop {
            let next = match (host_candidates.get(i), self.any_host.get(j)) {
                (Some(&a), Some(&b)) if a < b => {
                    i += 1;
                    a
                }
                (_, Some(&b)) => {
                    j += 1;
                    b
                }
                (Some(&a), None) => {
                    i += 1;
                    a
                }
                (None, None) => return None,
            };
            let route = &self.routes[next];
            if route.matches(req) {
                return Some(route);
            }
        }
    }

    /// Routes in precedence order.
    pub fn routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CompiledRoute>> {
        self.routes.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    fn router(rule: &str, service: &str, priority: Option<i64>) -> ResolvedRouter {
        ResolvedRouter {
            source: "test".into(),
            rule: rule.into(),
            service: service.into(),
            middlewares: Vec::new(),
            priority,
            tls: false,
        }
    }

    fn table(entries: &[(&str, ResolvedRouter)]) -> (RouteTable, Vec<EntityError>) {
        let routers: BTreeMap<String, ResolvedRouter> = entries
            .iter()
            .map(|(n, r)| (n.to_string(), r.clone()))
            .collect();
        RouteTable::compile(&routers, &[])
    }

    fn lookup(table: &RouteTable, host: &str, path: &str) -> Option<String> {
        let req = Request::builder()
            .uri(path)
            .header("Host", host)
            .body(Body::default())
            .unwrap();
        let info = RequestInfo::from_request(&req);
        table.match_request(&info).map(|r| r.service.clone())
    }

    #[test]
    fn specific_path_beats_host_only() {
        let (t, errors) = table(&[
            ("host-only@a", router("Host(`a.example.com`)", "host", None)),
            ("api@a", router("Host(`a.example.com`) && PathPrefix(`/api`)", "api", None)),
        ]);
        assert!(errors.is_empty());
        assert_eq!(lookup(&t, "a.example.com", "/api").as_deref(), Some("api"));
        assert_eq!(lookup(&t, "a.example.com", "/other").as_deref(), Some("host"));
        assert_eq!(lookup(&t, "b.example.com", "/api"), None);
    }

    #[test]
    fn checkout_scenario() {
        let (t, _) = table(&[
            ("r1@a", router("Host(`shop.test`) && PathPrefix(`/`)", "svc1", None)),
            ("r2@b", router("Host(`shop.test`) && PathPrefix(`/checkout`)", "svc2", None)),
        ]);
        assert_eq!(lookup(&t, "shop.test", "/checkout").as_deref(), Some("svc2"));
        assert_eq!(lookup(&t, "shop.test", "/").as_deref(), Some("svc1"));
    }

    #[test]
    fn explicit_priority_wins() {
        let (t, _) = table(&[
            ("catch-all@a", router("PathPrefix(`/`)", "fallback", Some(1000))),
            ("api@a", router("Host(`a.test`) && PathPrefix(`/api`)", "api", None)),
        ]);
        assert_eq!(lookup(&t, "a.test", "/api").as_deref(), Some("fallback"));
    }

    #[test]
    fn host_agnostic_routes_interleave_by_precedence() {
        let (t, _) = table(&[
            ("global@a", router("PathPrefix(`/very/long/prefix`)", "global", None)),
            ("host@a", router("Host(`h.test`)", "host", None)),
        ]);
        assert_eq!(lookup(&t, "h.test", "/very/long/prefix/x").as_deref(), Some("global"));
        assert_eq!(lookup(&t, "h.test", "/short").as_deref(), Some("host"));
        assert_eq!(lookup(&t, "other.test", "/very/long/prefix").as_deref(), Some("global"));
    }

    #[test]
    fn ties_broken_by_configuration_order() {
        let (t, _) = table(&[
            ("b@p", router("Header(`x-a`, `1`)", "second", Some(5))),
            ("a@p", router("Header(`x-b`, `1`)", "first", Some(5))),
        ]);
        let names: Vec<_> = t.routes().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a@p", "b@p"]);
    }

    #[test]
    fn invalid_rule_excluded_others_compile() {
        let (t, errors) = table(&[
            ("bad@a", router("Host(`oops`", "x", None)),
            ("good@a", router("Host(`ok.test`)", "ok", None)),
        ]);
        assert_eq!(t.len(), 1);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].entity, "bad@a");
        assert_eq!(lookup(&t, "ok.test", "/").as_deref(), Some("ok"));
    }

    #[test]
    fn excluded_routers_skipped() {
        let routers: BTreeMap<String, ResolvedRouter> = [
            ("a@p".to_string(), router("Host(`a.test`)", "a", None)),
            ("b@p".to_string(), router("Host(`b.test`)", "b", None)),
        ]
        .into_iter()
        .collect();
        let (t, errors) = RouteTable::compile(&routers, &["a@p".to_string()]);
        assert!(errors.is_empty());
        assert_eq!(t.len(), 1);
        assert!(t.get("a@p").is_none());
    }
}
