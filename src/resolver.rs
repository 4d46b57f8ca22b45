//! # Dependency Resolution
//!
//! Computes the transitive closure of packages required to install a
//! target, and a topological build order over a package set. Dependency
//! specs may pin versions; pins select the recipe during the walk, but the
//! result carries bare names and deduplication is by name, so the first
//! version seen for a name wins.

use log::{debug, trace};
use std::collections::HashSet;
use thiserror::Error;

use crate::database::InstalledPackage;
use crate::manifest::split_spec;
use crate::repository::Repository;

/// Resolver error types
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Package '{0}' not found in the repository")]
    UnknownPackage(String),

    #[error("Circular dependency detected: {cycle}")]
    CircularDependency { cycle: String },
}

/// Resolves dependency closures against one repository snapshot.
pub struct Resolver<'a> {
    repo: &'a Repository,
}

impl<'a> Resolver<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    /// The ordered closure of package names that must be installed for
    /// `target`, excluding anything already present in `installed` (matched
    /// by name). Dependencies precede dependents; the target's resolved
    /// name comes last. Version pins in specs steer the repository lookups
    /// during the walk, but the returned elements are bare names.
    pub fn resolve(
        &self,
        target: &str,
        installed: &[InstalledPackage],
    ) -> Result<Vec<String>, ResolveError> {
        let mut visited = Vec::new();
        let order = self.resolve_spec(target, installed, &mut visited)?;
        debug!("Resolved '{}' to install order: {:?}", target, order);
        Ok(order)
    }

    fn resolve_spec(
        &self,
        spec: &str,
        installed: &[InstalledPackage],
        visited: &mut Vec<String>,
    ) -> Result<Vec<String>, ResolveError> {
        let (name, _) = split_spec(spec);

        if visited.iter().any(|v| split_spec(v).0 == name) {
            let mut cycle: Vec<&str> = visited.iter().map(String::as_str).collect();
            cycle.push(spec);
            return Err(ResolveError::CircularDependency {
                cycle: cycle.join(" -> "),
            });
        }

        if installed.iter().any(|p| p.name == name) {
            trace!("'{}' already installed, nothing to resolve", name);
            return Ok(Vec::new());
        }

        let package = self
            .repo
            .get_spec(spec)
            .ok_or_else(|| ResolveError::UnknownPackage(spec.to_string()))?;

        visited.push(spec.to_string());
        let mut order: Vec<String> = Vec::new();

        // Runtime dependencies first, then build dependencies, each in
        // declared order.
        let deps = package
            .dependencies
            .iter()
            .chain(package.build_dependencies.iter());
        for dep in deps {
            let (dep_name, _) = split_spec(dep);
            if dep_name == package.name {
                trace!("Ignoring self-dependency of '{}'", package.name);
                continue;
            }
            if order.iter().any(|s| s.as_str() == dep_name) {
                continue;
            }

            let sub = match self.resolve_spec(dep, installed, visited) {
                Ok(sub) => sub,
                Err(e) => {
                    visited.pop();
                    return Err(e);
                }
            };
            if sub.is_empty() && self.repo.get(dep_name).is_none() {
                visited.pop();
                return Err(ResolveError::UnknownPackage(dep.clone()));
            }
            for s in sub {
                if !order.contains(&s) {
                    order.push(s);
                }
            }
        }

        visited.pop();
        order.push(package.name.clone());
        Ok(order)
    }

    /// Topologically sort `specs` so that every package appears after its
    /// dependencies. Only edges between members of `specs` count. Among
    /// packages that are simultaneously ready, input order is kept.
    pub fn build_order(&self, specs: &[String]) -> Result<Vec<String>, ResolveError> {
        let names: Vec<&str> = specs.iter().map(|s| split_spec(s).0).collect();
        let name_set: HashSet<&str> = names.iter().copied().collect();

        // dep_sets[i]: names within the input set that specs[i] depends on
        let mut dep_sets: Vec<HashSet<&str>> = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut set = HashSet::new();
            if let Some(package) = self.repo.get_spec(spec) {
                let deps = package
                    .dependencies
                    .iter()
                    .chain(package.build_dependencies.iter());
                for dep in deps {
                    let (dep_name, _) = split_spec(dep);
                    if dep_name != package.name && name_set.contains(dep_name) {
                        if let Some(held) = names.iter().find(|n| **n == dep_name) {
                            set.insert(*held);
                        }
                    }
                }
            }
            dep_sets.push(set);
        }

        let mut in_degree: Vec<usize> = dep_sets.iter().map(HashSet::len).collect();
        let mut emitted = vec![false; specs.len()];
        let mut order = Vec::with_capacity(specs.len());

        while order.len() < specs.len() {
            let next = (0..specs.len()).find(|&i| !emitted[i] && in_degree[i] == 0);
            let Some(i) = next else {
                let stuck: Vec<&str> = (0..specs.len())
                    .filter(|&j| !emitted[j])
                    .map(|j| names[j])
                    .collect();
                return Err(ResolveError::CircularDependency {
                    cycle: stuck.join(" -> "),
                });
            };

            emitted[i] = true;
            order.push(specs[i].clone());
            for j in 0..specs.len() {
                if !emitted[j] && dep_sets[j].contains(names[i]) {
                    in_degree[j] -= 1;
                }
            }
        }

        debug!("Build order: {}", order.join(" -> "));
        Ok(order)
    }
}
