//! Dependency graph over resource ids.
//!
//! Edges point from a dependency to its dependent: `add_edge("db", "web")`
//! means `db` must be deployed before `web`.

use std::collections::HashMap;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Directed graph of resource ids with insertion-ordered nodes.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: &str) -> Result<()> {
        if self.index.contains_key(id) {
            return Err(Error::InvalidGraph(format!("duplicate node '{id}'")));
        }
        self.index.insert(id.to_string(), self.nodes.len());
        self.nodes.push(id.to_string());
        self.dependencies.push(Vec::new());
        self.dependents.push(Vec::new());
        Ok(())
    }

    /// Record that `from` must be deployed before `to`.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        let f = self.position(from)?;
        let t = self.position(to)?;
        if !self.dependencies[t].contains(&f) {
            self.dependencies[t].push(f);
            self.dependencies[t].sort_unstable();
            self.dependents[f].push(t);
            self.dependents[f].sort_unstable();
        }
        Ok(())
    }

    fn position(&self, id: &str) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::InvalidGraph(format!("unknown node '{id}'")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of `id`, in insertion order.
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| {
                self.dependencies[i]
                    .iter()
                    .map(|&d| self.nodes[d].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct dependents of `id`, in insertion order.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| {
                self.dependents[i]
                    .iter()
                    .map(|&d| self.nodes[d].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deployment order. Dependencies come first; independent nodes keep
    /// their insertion order.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut stack = Vec::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        for node in 0..self.nodes.len() {
            self.visit(node, &mut marks, &mut stack, &mut order)?;
        }

        Ok(order.into_iter().map(|i| self.nodes[i].clone()).collect())
    }

    fn visit(
        &self,
        node: usize,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<()> {
        match marks[node] {
            Mark::Done => return Ok(()),
            Mark::OnStack => {
                let start = stack.iter().position(|&n| n == node).unwrap_or(0);
                let mut cycle: Vec<String> =
                    stack[start..].iter().map(|&n| self.nodes[n].clone()).collect();
                cycle.push(self.nodes[node].clone());
                return Err(Error::CircularDependency { cycle });
            }
            Mark::Unvisited => {}
        }

        marks[node] = Mark::OnStack;
        stack.push(node);
        for &dep in &self.dependencies[node] {
            self.visit(dep, marks, stack, order)?;
        }
        stack.pop();
        marks[node] = Mark::Done;
        order.push(node);
        Ok(())
    }

    /// Group nodes into levels. Every node's dependencies sit in earlier
    /// levels, so nodes within a level can be deployed concurrently.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let order = self.topological_order()?;
        let mut depth = vec![0usize; self.nodes.len()];
        let mut levels: Vec<Vec<usize>> = Vec::new();

        for id in &order {
            let i = self.index[id.as_str()];
            depth[i] = self.dependencies[i]
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
            if levels.len() <= depth[i] {
                levels.resize_with(depth[i] + 1, Vec::new);
            }
            levels[depth[i]].push(i);
        }

        Ok(levels
            .into_iter()
            .map(|mut level| {
                level.sort_unstable();
                level.into_iter().map(|i| self.nodes[i].clone()).collect()
            })
            .collect())
    }

    /// Every node that depends on `id`, directly or not.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.nodes.len()];
        let mut pending = vec![start];
        while let Some(n) = pending.pop() {
            for &d in &self.dependents[n] {
                if !seen[d] {
                    seen[d] = true;
                    pending.push(d);
                }
            }
        }
        (0..self.nodes.len())
            .filter(|&i| seen[i])
            .map(|i| self.nodes[i].clone())
            .collect()
    }
}
