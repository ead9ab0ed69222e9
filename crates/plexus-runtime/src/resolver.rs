//! Dependency resolution
//!
//! Orders a batch of candidate plugins so every plugin comes after the
//! plugins it depends on. Plugins are grouped by depth in the dependency
//! graph; within a depth, higher priority goes first and ties break on the
//! plugin id, so startup order is deterministic.
//!
//! Required dependencies must be among the candidates or already satisfied
//! by the host. Optional dependencies only influence ordering when present.

use plexus_core::{PluginError, PluginMetadata, PluginPriority, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Topological ordering of plugins by declared dependencies
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// Create a resolver
    pub fn new() -> Self {
        Self
    }

    /// Order `candidates` for initialization.
    ///
    /// `satisfied` reports whether a plugin outside the batch already
    /// fulfils a dependency (for example because it is running).
    pub fn resolve<F>(&self, candidates: &[PluginMetadata], satisfied: F) -> Result<Vec<String>>
    where
        F: Fn(&str) -> bool,
    {
        let nodes: BTreeMap<&str, &PluginMetadata> =
            candidates.iter().map(|m| (m.id.as_str(), m)).collect();

        for meta in nodes.values() {
            for dep in &meta.dependencies {
                if !nodes.contains_key(dep.as_str()) && !satisfied(dep) {
                    return Err(PluginError::dependency_missing(&meta.id, dep));
                }
            }
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();
        for id in nodes.keys() {
            detect_cycle(*id, &nodes, &mut marks, &mut path)?;
        }

        let edges = ordering_edges(&nodes);
        let mut depths: HashMap<&str, usize> = HashMap::new();
        for id in nodes.keys() {
            depth(*id, &edges, &mut depths);
        }

        let mut order: Vec<(&str, usize, PluginPriority)> = nodes
            .iter()
            .map(|(id, meta)| (*id, depths.get(*id).copied().unwrap_or(0), meta.priority))
            .collect();
        order.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)).then(a.0.cmp(b.0)));

        let order: Vec<String> = order.into_iter().map(|(id, _, _)| id.to_string()).collect();
        debug!(order = ?order, "Dependency order resolved");
        Ok(order)
    }

    /// Plugins in `candidates` that transitively need `plugin_id`
    pub fn dependents_of(&self, plugin_id: &str, candidates: &[PluginMetadata]) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let mut frontier = vec![plugin_id.to_string()];
        while let Some(current) = frontier.pop() {
            for meta in candidates {
                if meta.dependencies.iter().any(|d| *d == current) && !found.contains(&meta.id) {
                    found.push(meta.id.clone());
                    frontier.push(meta.id.clone());
                }
            }
        }
        found.sort();
        found
    }
}

fn detect_cycle<'a>(
    id: &'a str,
    nodes: &BTreeMap<&'a str, &'a PluginMetadata>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Result<()> {
    match marks.get(id) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = path.iter().position(|p| *p == id).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Err(PluginError::circular_dependency(&cycle));
        }
        None => {}
    }

    let Some(meta) = nodes.get(id) else {
        return Ok(());
    };

    marks.insert(id, Mark::Visiting);
    path.push(id);
    for dep in &meta.dependencies {
        if let Some((key, _)) = nodes.get_key_value(dep.as_str()) {
            detect_cycle(*key, nodes, marks, path)?;
        }
    }
    path.pop();
    marks.insert(id, Mark::Done);
    Ok(())
}

/// Required edges plus every optional edge that does not close a cycle
fn ordering_edges<'a>(nodes: &BTreeMap<&'a str, &'a PluginMetadata>) -> BTreeMap<&'a str, Vec<&'a str>> {
    let mut edges: BTreeMap<&'a str, Vec<&'a str>> = nodes
        .iter()
        .map(|(id, meta)| {
            let deps = meta
                .dependencies
                .iter()
                .filter_map(|d| nodes.get_key_value(d.as_str()).map(|(k, _)| *k))
                .collect();
            (*id, deps)
        })
        .collect();

    for (id, meta) in nodes {
        for dep in &meta.optional_dependencies {
            let Some((dep, _)) = nodes.get_key_value(dep.as_str()) else {
                continue;
            };
            if !reaches(&edges, dep, id) {
                edges.entry(*id).or_default().push(*dep);
            }
        }
    }
    edges
}

fn reaches(edges: &BTreeMap<&str, Vec<&str>>, from: &str, to: &str) -> bool {
    let mut stack = vec![from];
    let mut seen: Vec<&str> = Vec::new();
    while let Some(current) = stack.pop() {
        if current == to {
            return true;
        }
        if seen.contains(&current) {
            continue;
        }
        seen.push(current);
        if let Some(next) = edges.get(current) {
            stack.extend(next.iter().copied());
        }
    }
    false
}

fn depth<'a>(id: &'a str, edges: &BTreeMap<&'a str, Vec<&'a str>>, depths: &mut HashMap<&'a str, usize>) -> usize {
    if let Some(d) = depths.get(id) {
        return *d;
    }
    let result = edges
        .get(id)
        .map(|deps| {
            deps.iter()
                .map(|dep| depth(*dep, edges, depths) + 1)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    depths.insert(id, result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::ErrorKind;

    fn meta(id: &str, deps: &[&str]) -> PluginMetadata {
        let mut builder = PluginMetadata::builder(id);
        for dep in deps {
            builder = builder.dependency(*dep);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_dependencies_come_first() {
        let candidates = vec![meta("com.example.b", &["com.example.a"]), meta("com.example.a", &[])];
        let order = DependencyResolver::new().resolve(&candidates, |_| false).unwrap();
        assert_eq!(order, vec!["com.example.a", "com.example.b"]);
    }

    #[test]
    fn test_ties_break_by_priority_then_id() {
        let mut high = meta("com.example.zeta", &[]);
        high.priority = PluginPriority::High;
        let candidates = vec![
            meta("com.example.beta", &[]),
            meta("com.example.alpha", &[]),
            high,
        ];
        let order = DependencyResolver::new().resolve(&candidates, |_| false).unwrap();
        assert_eq!(order, vec!["com.example.zeta", "com.example.alpha", "com.example.beta"]);
    }

    #[test]
    fn test_cycle_names_path() {
        let candidates = vec![meta("com.example.y", &["com.example.x"]), meta("com.example.x", &["com.example.y"])];
        let err = DependencyResolver::new().resolve(&candidates, |_| false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircularDependency);
        assert_eq!(err.details(), Some("com.example.x -> com.example.y -> com.example.x"));
    }

    #[test]
    fn test_missing_dependency_named() {
        let candidates = vec![meta("com.example.b", &["com.example.missing"])];
        let err = DependencyResolver::new().resolve(&candidates, |_| false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyMissing);
        assert!(err.message().contains("com.example.missing"));
    }

    #[test]
    fn test_external_dependency_satisfied() {
        let candidates = vec![meta("com.example.b", &["com.example.running"])];
        let order = DependencyResolver::new()
            .resolve(&candidates, |id| id == "com.example.running")
            .unwrap();
        assert_eq!(order, vec!["com.example.b"]);
    }

    #[test]
    fn test_optional_cycle_does_not_block() {
        let a = PluginMetadata::builder("com.example.a")
            .optional_dependency("com.example.b")
            .build()
            .unwrap();
        let b = meta("com.example.b", &["com.example.a"]);
        let order = DependencyResolver::new().resolve(&[a, b], |_| false).unwrap();
        assert_eq!(order, vec!["com.example.a", "com.example.b"]);
    }

    #[test]
    fn test_dependents_are_transitive() {
        let candidates = vec![
            meta("com.example.a", &[]),
            meta("com.example.b", &["com.example.a"]),
            meta("com.example.c", &["com.example.b"]),
        ];
        let dependents = DependencyResolver::new().dependents_of("com.example.a", &candidates);
        assert_eq!(dependents, vec!["com.example.b", "com.example.c"]);
    }
}
