//! Dependency ordering of pending writes.
//!
//! Nodes are entities with a pending operation; an edge `from -> to` says the
//! row of `to` must exist before the row of `from` (because `from` holds a
//! foreign key to it). Sorting yields an order in which every node follows
//! the nodes it depends on. Deletes use the same graph, reversed.
//!
//! Edges whose foreign key columns are all nullable are *deferrable*: under
//! [`CyclePolicy::DeferNullable`] such an edge may be dropped to break a
//! cycle, and the caller writes the foreign key with a separate update.

use relmap_core::{CommitOrderingError, Error, ObjectId};
use std::collections::{HashMap, HashSet};

/// How dependency cycles among pending writes are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CyclePolicy {
    /// Break cycles through nullable foreign keys; reject the rest.
    #[default]
    DeferNullable,
    /// Reject every cycle.
    Reject,
}

impl CyclePolicy {
    /// Parse `defer` / `reject`, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "defer" | "defer_nullable" | "defer-nullable" => Some(CyclePolicy::DeferNullable),
            "reject" => Some(CyclePolicy::Reject),
            _ => None,
        }
    }
}

/// A dependency dropped to break a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredEdge {
    pub from: ObjectId,
    pub to: ObjectId,
    pub association: String,
}

#[derive(Debug, Clone)]
struct Edge {
    to: usize,
    association: String,
    deferrable: bool,
}

/// Sorted nodes plus the dependencies that had to be deferred.
#[derive(Debug, Clone, Default)]
pub struct CommitOrder {
    pub order: Vec<ObjectId>,
    pub deferred: Vec<DeferredEdge>,
}

/// Builds the dependency graph and sorts it.
#[derive(Debug, Default)]
pub struct CommitOrderCalculator {
    nodes: Vec<(ObjectId, String)>,
    index: HashMap<ObjectId, usize>,
    edges: Vec<Vec<Edge>>,
    self_loops: Vec<(usize, Edge)>,
}

impl CommitOrderCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; `label` names it in cycle errors. Re-adding is a no-op.
    pub fn add_node(&mut self, oid: ObjectId, label: impl Into<String>) {
        if self.index.contains_key(&oid) {
            return;
        }
        self.index.insert(oid, self.nodes.len());
        self.nodes.push((oid, label.into()));
        self.edges.push(Vec::new());
    }

    pub fn has_node(&self, oid: ObjectId) -> bool {
        self.index.contains_key(&oid)
    }

    /// `from` depends on `to`. Edges touching unknown nodes are ignored.
    pub fn add_dependency(
        &mut self,
        from: ObjectId,
        to: ObjectId,
        association: impl Into<String>,
        deferrable: bool,
    ) {
        let (Some(&f), Some(&t)) = (self.index.get(&from), self.index.get(&to)) else {
            return;
        };
        let edge = Edge {
            to: t,
            association: association.into(),
            deferrable,
        };
        if f == t {
            self.self_loops.push((f, edge));
        } else {
            self.edges[f].push(edge);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Sort the graph so dependencies come first.
    ///
    /// Nodes without dependencies between them keep their insertion order.
    pub fn sort(&self, policy: CyclePolicy) -> Result<CommitOrder, Error> {
        let mut deferred = Vec::new();

        for (node, edge) in &self.self_loops {
            if policy == CyclePolicy::Reject || !edge.deferrable {
                let label = self.nodes[*node].1.clone();
                return Err(self.cycle_error(vec![label.clone(), label]));
            }
            deferred.push(self.deferred_edge(*node, edge));
        }

        // Mandatory edges can never be dropped, so they must be acyclic on their own.
        let mut kept: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (from, edges) in self.edges.iter().enumerate() {
            for edge in edges.iter().filter(|e| !e.deferrable) {
                kept[from].push(edge.to);
            }
        }
        if let Some(cycle) = self.find_cycle(&kept) {
            return Err(self.cycle_error(cycle));
        }

        for (from, edges) in self.edges.iter().enumerate() {
            for edge in edges.iter().filter(|e| e.deferrable) {
                if reachable(&kept, edge.to, from) {
                    if policy == CyclePolicy::Reject {
                        kept[from].push(edge.to);
                        let cycle = self.find_cycle(&kept).unwrap_or_default();
                        return Err(self.cycle_error(cycle));
                    }
                    tracing::warn!(
                        from = %self.nodes[from].1,
                        to = %self.nodes[edge.to].1,
                        association = %edge.association,
                        "Deferring foreign key to break a dependency cycle"
                    );
                    deferred.push(self.deferred_edge(from, edge));
                } else {
                    kept[from].push(edge.to);
                }
            }
        }

        let order = self.post_order(&kept);
        tracing::debug!(
            nodes = order.len(),
            deferred = deferred.len(),
            "Commit order computed"
        );
        Ok(CommitOrder { order, deferred })
    }

    fn deferred_edge(&self, from: usize, edge: &Edge) -> DeferredEdge {
        DeferredEdge {
            from: self.nodes[from].0,
            to: self.nodes[edge.to].0,
            association: edge.association.clone(),
        }
    }

    fn cycle_error(&self, cycle: Vec<String>) -> Error {
        Error::CommitOrdering(CommitOrderingError { cycle })
    }

    /// Depth-first post-order: each node is emitted after everything it depends on.
    fn post_order(&self, graph: &[Vec<usize>]) -> Vec<ObjectId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        for start in 0..self.nodes.len() {
            if visited[start] {
                continue;
            }
            // Explicit stack of (node, next edge index)
            let mut stack = vec![(start, 0usize)];
            visited[start] = true;
            while let Some((node, next)) = stack.pop() {
                if let Some(&dep) = graph[node].get(next) {
                    stack.push((node, next + 1));
                    if !visited[dep] {
                        visited[dep] = true;
                        stack.push((dep, 0));
                    }
                } else {
                    order.push(self.nodes[node].0);
                }
            }
        }
        order
    }

    /// Find a cycle and return its labels, first node repeated at the end.
    fn find_cycle(&self, graph: &[Vec<usize>]) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();
        for start in 0..self.nodes.len() {
            if !visited.contains(&start)
                && detect_cycle_dfs(graph, start, &mut visited, &mut rec_stack, &mut path)
            {
                let closing = path.last().copied()?;
                let first = path.iter().position(|&n| n == closing)?;
                return Some(
                    path[first..]
                        .iter()
                        .map(|&n| self.nodes[n].1.clone())
                        .collect(),
                );
            }
        }
        None
    }
}

fn detect_cycle_dfs(
    graph: &[Vec<usize>],
    node: usize,
    visited: &mut HashSet<usize>,
    rec_stack: &mut HashSet<usize>,
    path: &mut Vec<usize>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    for &dep in &graph[node] {
        if !visited.contains(&dep) {
            if detect_cycle_dfs(graph, dep, visited, rec_stack, path) {
                return true;
            }
        } else if rec_stack.contains(&dep) {
            path.push(dep);
            return true;
        }
    }

    rec_stack.remove(&node);
    path.pop();
    false
}

fn reachable(graph: &[Vec<usize>], from: usize, target: usize) -> bool {
    let mut seen = vec![false; graph.len()];
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        if node == target {
            return true;
        }
        if std::mem::replace(&mut seen[node], true) {
            continue;
        }
        stack.extend(graph[node].iter().copied());
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{Entity, EntityMetadata, EntityRef, FieldMetadata, SqlType};
    use std::sync::Arc;

    fn nodes(n: usize) -> Vec<EntityRef> {
        let meta = Arc::new(
            EntityMetadata::builder("Node")
                .id(FieldMetadata::new("id", SqlType::BigInt))
                .build()
                .unwrap(),
        );
        (0..n)
            .map(|_| EntityRef::new(Entity::new(Arc::clone(&meta))))
            .collect()
    }

    fn calculator(refs: &[EntityRef]) -> CommitOrderCalculator {
        let mut calc = CommitOrderCalculator::new();
        for (i, r) in refs.iter().enumerate() {
            calc.add_node(r.object_id(), format!("N{i}"));
        }
        calc
    }

    fn position(order: &CommitOrder, r: &EntityRef) -> usize {
        order.order.iter().position(|o| *o == r.object_id()).unwrap()
    }

    #[test]
    fn test_dependency_comes_first() {
        let refs = nodes(3);
        let mut calc = calculator(&refs);
        // N0 -> N1 -> N2
        calc.add_dependency(refs[0].object_id(), refs[1].object_id(), "next", false);
        calc.add_dependency(refs[1].object_id(), refs[2].object_id(), "next", false);
        let order = calc.sort(CyclePolicy::default()).unwrap();
        assert_eq!(order.order.len(), 3);
        assert!(position(&order, &refs[2]) < position(&order, &refs[1]));
        assert!(position(&order, &refs[1]) < position(&order, &refs[0]));
        assert!(order.deferred.is_empty());
    }

    #[test]
    fn test_independent_nodes_keep_insertion_order() {
        let refs = nodes(4);
        let calc = calculator(&refs);
        let order = calc.sort(CyclePolicy::default()).unwrap();
        let expected: Vec<ObjectId> = refs.iter().map(EntityRef::object_id).collect();
        assert_eq!(order.order, expected);
    }

    #[test]
    fn test_mandatory_cycle_is_rejected() {
        let refs = nodes(2);
        let mut calc = calculator(&refs);
        calc.add_dependency(refs[0].object_id(), refs[1].object_id(), "b", false);
        calc.add_dependency(refs[1].object_id(), refs[0].object_id(), "a", false);
        let err = calc.sort(CyclePolicy::DeferNullable).unwrap_err();
        match err {
            Error::CommitOrdering(e) => {
                assert_eq!(e.cycle.len(), 3);
                assert_eq!(e.cycle.first(), e.cycle.last());
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_nullable_edge_is_deferred() {
        let refs = nodes(2);
        let mut calc = calculator(&refs);
        calc.add_dependency(refs[0].object_id(), refs[1].object_id(), "b", false);
        calc.add_dependency(refs[1].object_id(), refs[0].object_id(), "a", true);
        let order = calc.sort(CyclePolicy::DeferNullable).unwrap();
        assert!(position(&order, &refs[1]) < position(&order, &refs[0]));
        assert_eq!(
            order.deferred,
            vec![DeferredEdge {
                from: refs[1].object_id(),
                to: refs[0].object_id(),
                association: "a".into(),
            }]
        );
    }

    #[test]
    fn test_reject_policy_refuses_nullable_cycle() {
        let refs = nodes(2);
        let mut calc = calculator(&refs);
        calc.add_dependency(refs[0].object_id(), refs[1].object_id(), "b", true);
        calc.add_dependency(refs[1].object_id(), refs[0].object_id(), "a", true);
        assert!(matches!(
            calc.sort(CyclePolicy::Reject),
            Err(Error::CommitOrdering(_))
        ));
        let order = calc.sort(CyclePolicy::DeferNullable).unwrap();
        assert_eq!(order.deferred.len(), 1);
    }

    #[test]
    fn test_self_reference() {
        let refs = nodes(1);
        let mut calc = calculator(&refs);
        calc.add_dependency(refs[0].object_id(), refs[0].object_id(), "parent", true);
        let order = calc.sort(CyclePolicy::DeferNullable).unwrap();
        assert_eq!(order.order.len(), 1);
        assert_eq!(order.deferred.len(), 1);

        let mut strict = calculator(&refs);
        strict.add_dependency(refs[0].object_id(), refs[0].object_id(), "parent", false);
        assert!(strict.sort(CyclePolicy::DeferNullable).is_err());
    }

    #[test]
    fn test_unknown_nodes_are_ignored() {
        let refs = nodes(2);
        let mut calc = CommitOrderCalculator::new();
        calc.add_node(refs[0].object_id(), "N0");
        calc.add_dependency(refs[0].object_id(), refs[1].object_id(), "x", false);
        assert!(!calc.has_node(refs[1].object_id()));
        assert_eq!(calc.sort(CyclePolicy::default()).unwrap().order.len(), 1);
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(CyclePolicy::from_name("Reject"), Some(CyclePolicy::Reject));
        assert_eq!(
            CyclePolicy::from_name("defer"),
            Some(CyclePolicy::DeferNullable)
        );
        assert_eq!(CyclePolicy::from_name("ignore"), None);
    }
}
