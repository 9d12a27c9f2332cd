//! Configuration merger.
//!
//! Folds the current fragment of every source into one [`DynamicConfig`].
//! Invalid entities are excluded and reported; everything else still applies.

use std::collections::{BTreeMap, BTreeSet};

use crate::dynamic::naming::{self, Resolver};
use crate::dynamic::types::{
    DynamicConfig, EntityError, EntityKind, MiddlewareConfig, ResolvedMiddleware, ResolvedRouter,
    ResolvedService, RouterConfig, ServiceConfig, TopologyFragment, WeightedService,
};

/// Result of a merge: the canonical configuration plus per-entity diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub config: DynamicConfig,
    pub errors: Vec<EntityError>,
}

/// Merge all current fragments, keyed by source name.
///
/// The map is ordered, so the output depends only on the set of fragments and
/// never on the order in which providers delivered them.
pub fn merge(fragments: &BTreeMap<String, TopologyFragment>) -> MergeOutcome {
    let mut errors = Vec::new();

    let mut raw_routers: BTreeMap<String, (String, RouterConfig)> = BTreeMap::new();
    let mut raw_services: BTreeMap<String, (String, ServiceConfig)> = BTreeMap::new();
    let mut raw_middlewares: BTreeMap<String, (String, MiddlewareConfig)> = BTreeMap::new();
    let mut accepted_sources = Vec::new();

    for (source, fragment) in fragments {
        if let Err(reason) = naming::check_local_name(source) {
            errors.push(EntityError::new(EntityKind::Source, source, source, reason));
            continue;
        }
        accepted_sources.push(source.as_str());

        collect(source, &fragment.routers, EntityKind::Router, &mut raw_routers, &mut errors);
        collect(source, &fragment.services, EntityKind::Service, &mut raw_services, &mut errors);
        collect(
            source,
            &fragment.middlewares,
            EntityKind::Middleware,
            &mut raw_middlewares,
            &mut errors,
        );
    }

    let service_aliases = collect_aliases(
        fragments,
        &accepted_sources,
        |f| &f.aliases.services,
        &raw_services,
        &mut errors,
    );
    let middleware_aliases = collect_aliases(
        fragments,
        &accepted_sources,
        |f| &f.aliases.middlewares,
        &raw_middlewares,
        &mut errors,
    );

    let services = resolve_services(raw_services, &service_aliases, &mut errors);

    let middlewares: BTreeMap<String, ResolvedMiddleware> = raw_middlewares
        .into_iter()
        .map(|(name, (source, config))| (name, ResolvedMiddleware { source, config }))
        .collect();

    let routers = resolve_routers(
        raw_routers,
        &services,
        &service_aliases,
        &middlewares,
        &middleware_aliases,
        &mut errors,
    );

    errors.sort();

    MergeOutcome {
        config: DynamicConfig {
            routers,
            services,
            middlewares,
        },
        errors,
    }
}

fn collect<V: Clone>(
    source: &str,
    entities: &BTreeMap<String, V>,
    kind: EntityKind,
    into: &mut BTreeMap<String, (String, V)>,
    errors: &mut Vec<EntityError>,
) {
    for (name, value) in entities {
        if let Err(reason) = naming::check_local_name(name) {
            errors.push(EntityError::new(kind, name, source, reason));
            continue;
        }
        into.insert(naming::qualify(name, source), (source.to_string(), value.clone()));
    }
}

/// Build the global alias table. The first source (in name order) to claim an
/// alias keeps it.
fn collect_aliases<V>(
    fragments: &BTreeMap<String, TopologyFragment>,
    sources: &[&str],
    select: impl Fn(&TopologyFragment) -> &BTreeMap<String, String>,
    declared: &BTreeMap<String, V>,
    errors: &mut Vec<EntityError>,
) -> BTreeMap<String, String> {
    let mut aliases: BTreeMap<String, String> = BTreeMap::new();

    for source in sources {
        let Some(fragment) = fragments.get(*source) else {
            continue;
        };
        for (alias, local) in select(fragment) {
            if let Err(reason) = naming::check_local_name(alias) {
                errors.push(EntityError::new(EntityKind::Alias, alias, *source, reason));
                continue;
            }
            let target = naming::qualify(local, source);
            if !declared.contains_key(&target) {
                errors.push(EntityError::new(
                    EntityKind::Alias,
                    alias,
                    *source,
                    format!("alias target `{}` is not declared by this source", local),
                ));
                continue;
            }
            if let Some(existing) = aliases.get(alias) {
                errors.push(EntityError::new(
                    EntityKind::Alias,
                    alias,
                    *source,
                    format!("alias already claimed by `{}`", existing),
                ));
                continue;
            }
            aliases.insert(alias.clone(), target);
        }
    }

    aliases
}

fn resolve_services(
    raw: BTreeMap<String, (String, ServiceConfig)>,
    aliases: &BTreeMap<String, String>,
    errors: &mut Vec<EntityError>,
) -> BTreeMap<String, ResolvedService> {
    let mut resolved: BTreeMap<String, ResolvedService> = BTreeMap::new();

    {
        let resolver = Resolver::new(&raw, aliases);
        for (name, (source, config)) in &raw {
            let config = match config {
                ServiceConfig::LoadBalancer(lb) => {
                    if lb.servers.is_empty() {
                        // Kept: the service stays routable and fails at dispatch.
                        tracing::warn!(service = %name, "Service declares no servers");
                    }
                    ServiceConfig::LoadBalancer(lb.clone())
                }
                ServiceConfig::Weighted(weighted) => {
                    let mut children = Vec::with_capacity(weighted.services.len());
                    for child in &weighted.services {
                        match resolver.resolve(&child.name, source) {
                            Some(qualified) => children.push(WeightedService {
                                name: qualified,
                                weight: child.weight,
                            }),
                            None => errors.push(EntityError::new(
                                EntityKind::Service,
                                name,
                                source,
                                format!("child service `{}` not found", child.name),
                            )),
                        }
                    }
                    let mut weighted = weighted.clone();
                    weighted.services = children;
                    ServiceConfig::Weighted(weighted)
                }
            };
            resolved.insert(
                name.clone(),
                ResolvedService {
                    source: source.clone(),
                    config,
                },
            );
        }
    }

    let cyclic = find_cycles(&resolved);
    for name in &cyclic {
        if let Some(service) = resolved.remove(name) {
            errors.push(EntityError::new(
                EntityKind::Service,
                name,
                service.source,
                "cyclic weighted service reference",
            ));
        }
    }

    if !cyclic.is_empty() {
        let remaining: BTreeSet<String> = resolved.keys().cloned().collect();
        for (name, service) in resolved.iter_mut() {
            let source = &service.source;
            if let ServiceConfig::Weighted(weighted) = &mut service.config {
                weighted.services.retain(|child| {
                    let keep = remaining.contains(&child.name);
                    if !keep {
                        errors.push(EntityError::new(
                            EntityKind::Service,
                            name,
                            source,
                            format!("child service `{}` was dropped", child.name),
                        ));
                    }
                    keep
                });
            }
        }
    }

    resolved
}

/// Names of weighted services that can reach themselves.
fn find_cycles(services: &BTreeMap<String, ResolvedService>) -> BTreeSet<String> {
    let children = |name: &str| -> Vec<&str> {
        match services.get(name).map(|s| &s.config) {
            Some(ServiceConfig::Weighted(w)) => w.services.iter().map(|c| c.name.as_str()).collect(),
            _ => Vec::new(),
        }
    };

    let mut cyclic = BTreeSet::new();
    for start in services.keys() {
        let mut stack: Vec<&str> = children(start);
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        while let Some(next) = stack.pop() {
            if next == start.as_str() {
                cyclic.insert(start.clone());
                break;
            }
            if seen.insert(next) {
                stack.extend(children(next));
            }
        }
    }
    cyclic
}

fn resolve_routers(
    raw: BTreeMap<String, (String, RouterConfig)>,
    services: &BTreeMap<String, ResolvedService>,
    service_aliases: &BTreeMap<String, String>,
    middlewares: &BTreeMap<String, ResolvedMiddleware>,
    middleware_aliases: &BTreeMap<String, String>,
    errors: &mut Vec<EntityError>,
) -> BTreeMap<String, ResolvedRouter> {
    let service_resolver = Resolver::new(services, service_aliases);
    let middleware_resolver = Resolver::new(middlewares, middleware_aliases);
    let mut routers = BTreeMap::new();

    for (name, (source, router)) in raw {
        if router.rule.trim().is_empty() {
            errors.push(EntityError::new(EntityKind::Router, &name, &source, "empty rule"));
            continue;
        }

        let Some(service) = service_resolver.resolve(&router.service, &source) else {
            errors.push(EntityError::new(
                EntityKind::Router,
                &name,
                &source,
                format!("service `{}` not found", router.service),
            ));
            continue;
        };

        let mut chain = Vec::with_capacity(router.middlewares.len());
        let mut missing = None;
        for reference in &router.middlewares {
            match middleware_resolver.resolve(reference, &source) {
                Some(qualified) => chain.push(qualified),
                None => {
                    missing = Some(reference.clone());
                    break;
                }
            }
        }
        if let Some(reference) = missing {
            errors.push(EntityError::new(
                EntityKind::Router,
                &name,
                &source,
                format!("middleware `{}` not found", reference),
            ));
            continue;
        }

        routers.insert(
            name,
            ResolvedRouter {
                source,
                rule: router.rule,
                service,
                middlewares: chain,
                priority: router.priority,
                tls: router.tls,
            },
        );
    }

    routers
}
