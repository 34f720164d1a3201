//! Dependency-ordered load resolution
//!
//! Orders discovered manifests so that every non-optional dependency and
//! every `load_after` target (when present) precedes its dependents.
//! Kahn's algorithm over the combined edge set; ties are broken by
//! lexicographic plugin id so boot order is reproducible.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::{MissingDependency, ResolveError};
use crate::manifest::{Manifest, PluginId};

/// Resolve a load order over `manifests`.
///
/// Absent optional dependencies are silently dropped. Missing non-optional
/// dependencies are all collected before returning. A cycle is reported as
/// the set of nodes left unprocessed when the queue drains, sorted by id.
/// Inputs are not mutated.
pub fn resolve_load_order(manifests: &[Manifest]) -> Result<Vec<&Manifest>, ResolveError> {
    let by_id: HashMap<&str, &Manifest> = manifests.iter().map(|m| (m.id.as_str(), m)).collect();

    let mut missing = Vec::new();
    for manifest in manifests {
        for dep in &manifest.dependencies {
            if !dep.optional && !by_id.contains_key(dep.id.as_str()) {
                missing.push(MissingDependency {
                    plugin: manifest.plugin_id(),
                    dependency: dep.id.clone(),
                });
            }
        }
    }
    if !missing.is_empty() {
        return Err(ResolveError::Missing(missing));
    }

    // predecessor -> dependents, deduplicated so a dependency repeated in
    // both tables still counts as one edge.
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for manifest in manifests {
        in_degree.entry(manifest.id.as_str()).or_insert(0);

        let mut predecessors: HashSet<&str> = HashSet::new();
        for dep in &manifest.dependencies {
            if by_id.contains_key(dep.id.as_str()) {
                predecessors.insert(dep.id.as_str());
            }
        }
        for after in &manifest.load_after {
            if by_id.contains_key(after.as_str()) {
                predecessors.insert(after.as_str());
            }
        }

        *in_degree.entry(manifest.id.as_str()).or_insert(0) += predecessors.len();
        for pred in predecessors {
            dependents.entry(pred).or_default().push(manifest.id.as_str());
        }
    }

    let mut queue: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(manifests.len());
    while let Some(id) = queue.pop_first() {
        order.push(by_id[id]);
        if let Some(deps) = dependents.get(id) {
            for dependent in deps {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.insert(dependent);
                    }
                }
            }
        }
    }

    if order.len() != manifests.len() {
        let ordered: HashSet<&str> = order.iter().map(|m| m.id.as_str()).collect();
        let mut members: Vec<PluginId> = manifests
            .iter()
            .filter(|m| !ordered.contains(m.id.as_str()))
            .map(|m| m.plugin_id())
            .collect();
        members.sort();
        return Err(ResolveError::Cycle(members));
    }

    Ok(order)
}
