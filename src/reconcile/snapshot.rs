//! Routing snapshot: the immutable artifact the request path reads.
//!
//! # Responsibilities
//! - Build a snapshot from a Dynamic Configuration and the previous snapshot
//! - Hold the single shared reference to the current snapshot
//!
//! # Design Decisions
//! - Built off to the side, published with one pointer swap
//! - Readers take an `Arc` once per request; an old snapshot lives until its
//!   last request drops it
//! - Targets and persistent middleware state are shared with the previous
//!   snapshot, never copied or mutated

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;

use crate::dynamic::types::{DynamicConfig, EntityError, EntityKind};
use crate::load_balancer::pool::{PoolDefaults, PoolSet};
use crate::middleware::{MiddlewareChain, MiddlewareSet};
use crate::net::tls::CertificateResolver;
use crate::routing::RouteTable;

/// Inputs to a snapshot build that do not come from providers.
#[derive(Clone, Default)]
pub struct BuildContext {
    pub defaults: PoolDefaults,
    pub certificates: Option<Arc<dyn CertificateResolver>>,
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("defaults", &self.defaults)
            .field("certificates", &self.certificates.is_some())
            .finish()
    }
}

/// Compiled matcher, pools and middleware chains of one generation.
#[derive(Debug)]
pub struct RoutingSnapshot {
    pub generation: u64,
    pub built_at: SystemTime,
    pub config: Arc<DynamicConfig>,
    pub routes: RouteTable,
    pub pools: PoolSet,
    pub middlewares: MiddlewareSet,
    chains: HashMap<String, MiddlewareChain>,
    /// Every diagnostic of the cycle that built this snapshot.
    pub errors: Vec<EntityError>,
}

impl RoutingSnapshot {
    /// Generation 0: routes nothing.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            built_at: SystemTime::now(),
            config: Arc::new(DynamicConfig::default()),
            routes: RouteTable::default(),
            pools: PoolSet::default(),
            middlewares: MiddlewareSet::default(),
            chains: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Build the next snapshot. Pure with respect to `previous`.
    pub fn build(
        generation: u64,
        config: Arc<DynamicConfig>,
        merge_errors: Vec<EntityError>,
        previous: &RoutingSnapshot,
        ctx: &BuildContext,
    ) -> Self {
        let mut errors = merge_errors;

        let (middlewares, mw_errors) = MiddlewareSet::build(&config, &previous.middlewares);
        errors.extend(mw_errors);

        let (pools, pool_errors) = PoolSet::build(&config, &previous.pools, &ctx.defaults);
        errors.extend(pool_errors);

        // Routers using a middleware that failed to instantiate are dropped.
        let mut excluded = Vec::new();
        for (name, router) in &config.routers {
            if let Some(missing) = router.middlewares.iter().find(|m| middlewares.get(m).is_none()) {
                errors.push(EntityError::new(
                    EntityKind::Router,
                    name,
                    &router.source,
                    format!("middleware `{}` is unavailable", missing),
                ));
                excluded.push(name.clone());
            }
        }

        let (routes, route_errors) = RouteTable::compile(&config.routers, &excluded);
        errors.extend(route_errors);

        let mut chains = HashMap::with_capacity(routes.len());
        for route in routes.routes() {
            if let Ok(chain) = middlewares.chain(&route.middlewares) {
                chains.insert(route.name.clone(), chain);
            }
        }

        if let Some(resolver) = &ctx.certificates {
            errors.extend(certificate_diagnostics(&routes, &config, resolver.as_ref()));
        }

        errors.sort();
        errors.dedup();

        Self {
            generation,
            built_at: SystemTime::now(),
            config,
            routes,
            pools,
            middlewares,
            chains,
            errors,
        }
    }

    /// Middleware chain of a compiled route.
    pub fn chain(&self, router: &str) -> Option<&MiddlewareChain> {
        self.chains.get(router)
    }
}

fn certificate_diagnostics(
    routes: &RouteTable,
    config: &DynamicConfig,
    resolver: &dyn CertificateResolver,
) -> Vec<EntityError> {
    let mut errors = Vec::new();
    for route in routes.routes().iter().filter(|r| r.tls) {
        let source = config
            .routers
            .get(&route.name)
            .map(|r| r.source.as_str())
            .unwrap_or_default();
        let hosts: BTreeSet<String> = route.rule.required_hosts().unwrap_or_default().into_iter().collect();
        for host in hosts {
            if resolver.certificate_for(&host).is_none() {
                errors.push(EntityError::new(
                    EntityKind::Router,
                    &route.name,
                    source,
                    format!("no certificate for host `{}`", host),
                ));
            }
        }
    }
    errors
}

/// Shared reference to the current snapshot. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    current: Arc<ArcSwap<RoutingSnapshot>>,
}

impl SnapshotHandle {
    pub fn new(initial: RoutingSnapshot) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// The current snapshot. Hold it for the whole request.
    pub fn load(&self) -> Arc<RoutingSnapshot> {
        self.current.load_full()
    }

    pub fn publish(&self, snapshot: Arc<RoutingSnapshot>) {
        self.current.store(snapshot);
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }
}

impl Default for SnapshotHandle {
    fn default() -> Self {
        Self::new(RoutingSnapshot::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic::merge;
    use crate::dynamic::types::TopologyFragment;
    use crate::net::tls::{Certificate, CertificateStore};
    use std::collections::BTreeMap;

    fn fragments(raw: &[(&str, &str)]) -> BTreeMap<String, TopologyFragment> {
        raw.iter()
            .map(|(s, t)| (s.to_string(), toml::from_str(t).unwrap()))
            .collect()
    }

    fn build(raw: &[(&str, &str)], previous: &RoutingSnapshot, ctx: &BuildContext) -> RoutingSnapshot {
        let outcome = merge(&fragments(raw));
        RoutingSnapshot::build(
            previous.generation + 1,
            Arc::new(outcome.config),
            outcome.errors,
            previous,
            ctx,
        )
    }

    const SHOP: &str = r#"
        [routers.r1]
        rule = "Host(`shop.test`) && PathPrefix(`/`)"
        service = "svc1"
        middlewares = ["hdr"]

        [services.svc1.load_balancer]
        servers = [{ url = "http://10.0.0.1:80" }]

        [middlewares.hdr.headers]
        request = { "x-env" = "prod" }
    "#;

    #[test]
    fn builds_routes_pools_chains() {
        let snap = build(&[("a", SHOP)], &RoutingSnapshot::empty(), &BuildContext::default());
        assert!(snap.errors.is_empty(), "{:?}", snap.errors);
        assert_eq!(snap.routes.len(), 1);
        assert_eq!(snap.pools.target_count(), 1);
        assert_eq!(snap.chain("r1@a").unwrap().names(), vec!["hdr@a"]);
    }

    #[test]
    fn broken_middleware_drops_its_routers_only() {
        let raw = r#"
            [routers.bad]
            rule = "Host(`bad.test`)"
            service = "svc"
            middlewares = ["broken"]

            [routers.good]
            rule = "Host(`good.test`)"
            service = "svc"

            [services.svc.load_balancer]
            servers = [{ url = "http://10.0.0.1:80" }]

            [middlewares.broken.add_prefix]
            prefix = "no-slash"
        "#;
        let snap = build(&[("a", raw)], &RoutingSnapshot::empty(), &BuildContext::default());
        assert_eq!(snap.routes.len(), 1);
        assert!(snap.routes.get("good@a").is_some());
        let entities: Vec<_> = snap.errors.iter().map(|e| e.entity.as_str()).collect();
        assert!(entities.contains(&"bad@a"));
        assert!(entities.contains(&"broken@a"));
    }

    #[test]
    fn missing_certificate_is_a_diagnostic() {
        let raw = r#"
            [routers.secure]
            rule = "Host(`secure.test`) || Host(`www.apps.test`)"
            service = "svc"
            tls = true

            [services.svc.load_balancer]
            servers = [{ url = "http://10.0.0.1:80" }]
        "#;
        let generated = rcgen::generate_simple_self_signed(vec!["www.apps.test".to_string()]).unwrap();
        let mut store = CertificateStore::new();
        store
            .insert(
                Certificate::from_pem(
                    vec!["*.apps.test".into()],
                    generated.cert.pem().as_bytes(),
                    generated.key_pair.serialize_pem().as_bytes(),
                    "c.pem",
                    "k.pem",
                )
                .unwrap(),
            )
            .unwrap();
        let ctx = BuildContext {
            certificates: Some(Arc::new(store)),
            ..Default::default()
        };
        let snap = build(&[("a", raw)], &RoutingSnapshot::empty(), &ctx);
        assert_eq!(snap.routes.len(), 1);
        assert_eq!(snap.errors.len(), 1);
        assert!(snap.errors[0].reason.contains("secure.test"));
    }

    #[test]
    fn handle_swaps_atomically() {
        let handle = SnapshotHandle::default();
        let held = handle.load();
        assert_eq!(held.generation, 0);

        let next = build(&[("a", SHOP)], &held, &BuildContext::default());
        handle.publish(Arc::new(next));
        assert_eq!(handle.generation(), 1);
        // The earlier reader still sees its own generation.
        assert_eq!(held.generation, 0);
        assert!(held.routes.is_empty());
    }
}
