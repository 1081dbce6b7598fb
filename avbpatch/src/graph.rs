// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;
use tracing::{debug, trace};

use crate::profile::Profile;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Dependency cycle between partitions: {}", partitions.join(" -> "))]
    Cycle { partitions: Vec<String> },
    #[error("Partition {partition:?} depends on unknown partition {dependency:?}")]
    UnknownDependency {
        partition: String,
        dependency: String,
    },
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Dependency graph between the partitions of a profile. Nodes are indices
/// into the profile's partition list and edges point from a vbmeta partition
/// to the partitions it covers.
pub struct DependencyGraph<'a> {
    profile: &'a Profile,
    edges: Vec<Vec<usize>>,
}

impl<'a> DependencyGraph<'a> {
    pub fn new(profile: &'a Profile) -> Result<Self> {
        let edges = profile
            .partitions()
            .iter()
            .map(|p| {
                p.deps()
                    .iter()
                    .map(|d| {
                        profile
                            .index_of(d)
                            .ok_or_else(|| Error::UnknownDependency {
                                partition: p.name.clone(),
                                dependency: d.clone(),
                            })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { profile, edges })
    }

    fn name(&self, index: usize) -> &'a str {
        &self.profile.partitions()[index].name
    }

    fn visit(
        &self,
        node: usize,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<()> {
        match marks[node] {
            Mark::Visited => return Ok(()),
            Mark::Visiting => {
                // The cycle consists of everything on the path starting at the
                // first visit of this node.
                let start = path.iter().position(|n| *n == node).unwrap_or_default();
                let mut partitions = path[start..]
                    .iter()
                    .map(|n| self.name(*n).to_owned())
                    .collect::<Vec<_>>();
                partitions.push(self.name(node).to_owned());

                return Err(Error::Cycle { partitions });
            }
            Mark::Unvisited => {}
        }

        marks[node] = Mark::Visiting;
        path.push(node);

        for dep in &self.edges[node] {
            self.visit(*dep, marks, path, order)?;
        }

        path.pop();
        marks[node] = Mark::Visited;
        order.push(node);

        trace!("Resolved partition: {}", self.name(node));

        Ok(())
    }

    fn order_indices(&self) -> Result<Vec<usize>> {
        let num_nodes = self.edges.len();
        let mut marks = vec![Mark::Unvisited; num_nodes];
        let mut path = vec![];
        let mut order = Vec::with_capacity(num_nodes);

        for node in 0..num_nodes {
            self.visit(node, &mut marks, &mut path, &mut order)?;
        }

        Ok(order)
    }

    /// Dependency depth of every node. Depth 0 nodes have no dependencies.
    /// Every other node is one deeper than its deepest dependency.
    fn depths(&self) -> Result<Vec<usize>> {
        let order = self.order_indices()?;
        let mut depths = vec![0usize; self.edges.len()];

        for node in order {
            depths[node] = self.edges[node]
                .iter()
                .map(|d| depths[*d] + 1)
                .max()
                .unwrap_or(0);
        }

        Ok(depths)
    }

    /// Group the partitions by dependency depth. Within a level, partitions
    /// are in declaration order.
    pub fn levels(&self) -> Result<Vec<Vec<&'a str>>> {
        let depths = self.depths()?;
        let num_levels = depths.iter().max().map_or(0, |d| d + 1);
        let mut levels = vec![Vec::new(); num_levels];

        for (node, depth) in depths.into_iter().enumerate() {
            levels[depth].push(self.name(node));
        }

        debug!("Dependency levels: {levels:?}");

        Ok(levels)
    }

    /// Topological order of the partitions. Every partition comes after all of
    /// its dependencies, so leaves come first. Partitions at the same depth are
    /// in declaration order.
    pub fn order(&self) -> Result<Vec<&'a str>> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    /// Partitions that no other partition depends on, in declaration order.
    pub fn roots(&self) -> Vec<&'a str> {
        let mut has_parent = vec![false; self.edges.len()];

        for deps in &self.edges {
            for dep in deps {
                has_parent[*dep] = true;
            }
        }

        has_parent
            .iter()
            .enumerate()
            .filter(|(_, p)| !**p)
            .map(|(i, _)| self.name(i))
            .collect()
    }

    /// Partitions that directly depend on `name`.
    pub fn dependents(&self, name: &str) -> Vec<&'a str> {
        let Some(index) = self.profile.index_of(name) else {
            return vec![];
        };

        self.edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.contains(&index))
            .map(|(i, _)| self.name(i))
            .collect()
    }
}
