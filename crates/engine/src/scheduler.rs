//! Dependency ordering for creation and teardown.
//!
//! Everything here is a pure function of a [`DependencyMap`], so orders can be
//! recomputed at any time without side effects. The map's iteration order is
//! the declaration order used to break ties.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use indexmap::{IndexMap, IndexSet};

use crate::error::TemplateError;

/// Logical id → ids that must exist before it.
///
/// Edges pointing outside the map are ignored.
pub type DependencyMap = IndexMap<String, IndexSet<String>>;

/// Kahn's algorithm; among ready nodes the earliest declared goes first.
///
/// Fails with [`TemplateError::CyclicDependency`] naming one cycle, closed on
/// its first member (`A -> B -> A`).
pub fn topological_order(dependencies: &DependencyMap) -> Result<Vec<String>, TemplateError> {
    let mut in_degrees = vec![0usize; dependencies.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); dependencies.len()];

    for (index, (_, prerequisites)) in dependencies.iter().enumerate() {
        for prerequisite in prerequisites {
            if let Some(source) = dependencies.get_index_of(prerequisite) {
                in_degrees[index] += 1;
                dependents[source].push(index);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..dependencies.len()).filter(|index| in_degrees[*index] == 0).collect();
    let mut ordered = Vec::with_capacity(dependencies.len());
    while let Some(index) = ready.pop_first() {
        ordered.push(index);
        for dependent in &dependents[index] {
            in_degrees[*dependent] -= 1;
            if in_degrees[*dependent] == 0 {
                ready.insert(*dependent);
            }
        }
    }

    if ordered.len() != dependencies.len() {
        return Err(TemplateError::CyclicDependency {
            members: find_cycle(dependencies, &in_degrees),
        });
    }

    Ok(ordered
        .into_iter()
        .filter_map(|index| dependencies.get_index(index).map(|(id, _)| id.clone()))
        .collect())
}

/// Walk unsatisfied edges from the first blocked node until a node repeats.
///
/// Every blocked node has at least one blocked prerequisite, so the walk
/// always closes.
fn find_cycle(dependencies: &DependencyMap, in_degrees: &[usize]) -> Vec<String> {
    let blocked = |id: &String| dependencies.get_index_of(id).is_some_and(|index| in_degrees[index] > 0);

    let Some(start) = dependencies.keys().find(|id| blocked(id)) else {
        return Vec::new();
    };

    let mut path: Vec<String> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();
    let mut current = start.clone();
    loop {
        if let Some(first) = position.get(&current) {
            let mut members = path[*first..].to_vec();
            members.push(current);
            return members;
        }
        position.insert(current.clone(), path.len());
        path.push(current.clone());

        let next = dependencies
            .get(&current)
            .and_then(|prerequisites| prerequisites.iter().find(|id| blocked(id)))
            .cloned();
        match next {
            Some(next) => current = next,
            None => return path,
        }
    }
}

/// Linear creation order.
pub fn creation_order(dependencies: &DependencyMap) -> Result<Vec<String>, TemplateError> {
    topological_order(dependencies)
}

/// Exact reverse of [`creation_order`].
pub fn deletion_order(dependencies: &DependencyMap) -> Result<Vec<String>, TemplateError> {
    let mut order = topological_order(dependencies)?;
    order.reverse();
    Ok(order)
}

/// Nodes not yet completed whose prerequisites all are, in declaration order.
pub fn ready(dependencies: &DependencyMap, completed: &HashSet<String>) -> Vec<String> {
    dependencies
        .iter()
        .filter(|(id, _)| !completed.contains(*id))
        .filter(|(_, prerequisites)| {
            prerequisites
                .iter()
                .all(|prerequisite| completed.contains(prerequisite) || !dependencies.contains_key(prerequisite))
        })
        .map(|(id, _)| id.clone())
        .collect()
}

/// Every node that depends on `root`, directly or transitively.
pub fn transitive_dependents(dependencies: &DependencyMap, root: &str) -> IndexSet<String> {
    let inverted = invert(dependencies);
    let mut found = IndexSet::new();
    let mut queue = VecDeque::from([root.to_string()]);
    while let Some(id) = queue.pop_front() {
        if let Some(dependents) = inverted.get(&id) {
            for dependent in dependents {
                if found.insert(dependent.clone()) {
                    queue.push_back(dependent.clone());
                }
            }
        }
    }
    found.shift_remove(root);
    found
}

/// Flip every edge: id → ids that depend on it. Keeps the map's order.
pub fn invert(dependencies: &DependencyMap) -> DependencyMap {
    let mut inverted: DependencyMap = dependencies.keys().map(|id| (id.clone(), IndexSet::new())).collect();
    for (id, prerequisites) in dependencies {
        for prerequisite in prerequisites {
            if let Some(dependents) = inverted.get_mut(prerequisite) {
                dependents.insert(id.clone());
            }
        }
    }
    inverted
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Waiting,
    Dispatched,
    Done,
    Failed,
    Blocked,
}

/// Incremental scheduler handed to the executor.
///
/// Nodes become ready once all their prerequisites are done. Ties go to the
/// node that comes first in the queue's linear order, so draining the queue
/// one node at a time reproduces [`creation_order`] (or [`deletion_order`]).
#[derive(Debug)]
pub struct WorkQueue {
    ids: Vec<String>,
    remaining: Vec<usize>,
    successors: Vec<Vec<usize>>,
    slots: Vec<Slot>,
    ready: BTreeSet<usize>,
}

impl WorkQueue {
    /// Prerequisites must finish before their dependents start.
    pub fn for_creation(dependencies: &DependencyMap) -> Result<Self, TemplateError> {
        let order = creation_order(dependencies)?;
        Ok(Self::with_order(&order, dependencies))
    }

    /// Dependents must be gone before the resources they depend on.
    pub fn for_deletion(dependencies: &DependencyMap) -> Result<Self, TemplateError> {
        let order = deletion_order(dependencies)?;
        Ok(Self::with_order(&order, &invert(dependencies)))
    }

    /// `order` must already be a valid linear order for `prerequisites`.
    pub(crate) fn with_order(order: &[String], prerequisites: &DependencyMap) -> Self {
        let position: HashMap<&str, usize> = order.iter().enumerate().map(|(index, id)| (id.as_str(), index)).collect();
        let mut remaining = vec![0usize; order.len()];
        let mut successors = vec![Vec::new(); order.len()];
        for (index, id) in order.iter().enumerate() {
            let Some(required) = prerequisites.get(id) else { continue };
            for prerequisite in required {
                if let Some(source) = position.get(prerequisite.as_str()) {
                    remaining[index] += 1;
                    successors[*source].push(index);
                }
            }
        }
        let ready = (0..order.len()).filter(|index| remaining[*index] == 0).collect();
        Self {
            ids: order.to_vec(),
            remaining,
            successors,
            slots: vec![Slot::Waiting; order.len()],
            ready,
        }
    }

    /// Take the next node that may start.
    pub fn pop_ready(&mut self) -> Option<String> {
        let index = self.ready.pop_first()?;
        self.slots[index] = Slot::Dispatched;
        Some(self.ids[index].clone())
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Mark a node finished and release the nodes waiting on it.
    pub fn complete(&mut self, id: &str) {
        let Some(index) = self.index_of(id) else { return };
        self.slots[index] = Slot::Done;
        for successor in self.successors[index].clone() {
            self.remaining[successor] = self.remaining[successor].saturating_sub(1);
            if self.remaining[successor] == 0 && self.slots[successor] == Slot::Waiting {
                self.ready.insert(successor);
            }
        }
    }

    /// Mark a node failed. Returns every waiting node that can no longer run
    /// because of it, in queue order.
    pub fn fail(&mut self, id: &str) -> Vec<String> {
        let Some(index) = self.index_of(id) else { return Vec::new() };
        self.slots[index] = Slot::Failed;

        let mut blocked = BTreeSet::new();
        let mut queue = VecDeque::from(self.successors[index].clone());
        while let Some(successor) = queue.pop_front() {
            if self.slots[successor] != Slot::Waiting {
                continue;
            }
            self.slots[successor] = Slot::Blocked;
            self.ready.remove(&successor);
            blocked.insert(successor);
            queue.extend(self.successors[successor].iter().copied());
        }
        blocked.into_iter().map(|index| self.ids[index].clone()).collect()
    }

    /// Withdraw every node that has not been dispatched, in queue order.
    pub fn drain_undispatched(&mut self) -> Vec<String> {
        let mut drained = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if *slot == Slot::Waiting {
                *slot = Slot::Blocked;
                drained.push(self.ids[index].clone());
            }
        }
        self.ready.clear();
        drained
    }

    /// True once nothing is waiting to be dispatched.
    pub fn is_drained(&self) -> bool {
        !self.slots.contains(&Slot::Waiting)
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|candidate| candidate == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(edges: &[(&str, &[&str])]) -> DependencyMap {
        edges
            .iter()
            .map(|(id, prerequisites)| (id.to_string(), prerequisites.iter().map(|p| p.to_string()).collect()))
            .collect()
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|candidate| candidate == id).expect("id in order")
    }

    #[test]
    fn respects_every_edge_and_breaks_ties_by_declaration() {
        let dependencies = map(&[
            ("Instance", &["Subnet", "SecurityGroup"]),
            ("Subnet", &["VPC"]),
            ("SecurityGroup", &["VPC"]),
            ("Gateway", &[]),
            ("VPC", &[]),
        ]);
        let order = creation_order(&dependencies).unwrap();
        assert_eq!(order, vec!["Gateway", "VPC", "Subnet", "SecurityGroup", "Instance"]);
        for (id, prerequisites) in &dependencies {
            for prerequisite in prerequisites {
                assert!(position(&order, prerequisite) < position(&order, id));
            }
        }
    }

    #[test]
    fn deletion_is_exact_reverse() {
        let dependencies = map(&[("A", &[]), ("B", &["A"]), ("C", &[]), ("D", &["B", "C"])]);
        let mut creation = creation_order(&dependencies).unwrap();
        creation.reverse();
        assert_eq!(deletion_order(&dependencies).unwrap(), creation);
    }

    #[test]
    fn ordering_is_repeatable() {
        let dependencies = map(&[("B", &["A"]), ("A", &[]), ("C", &["A"])]);
        let first = creation_order(&dependencies).unwrap();
        let second = creation_order(&dependencies).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn reports_two_node_cycle() {
        let dependencies = map(&[("A", &["B"]), ("B", &["A"])]);
        let error = creation_order(&dependencies).unwrap_err();
        assert_eq!(
            error,
            TemplateError::CyclicDependency {
                members: vec!["A".into(), "B".into(), "A".into()],
            }
        );
    }

    #[test]
    fn reports_cycle_behind_acyclic_prefix() {
        let dependencies = map(&[
            ("Root", &[]),
            ("Leaf", &["X"]),
            ("X", &["Root", "Y"]),
            ("Y", &["Z"]),
            ("Z", &["X"]),
        ]);
        let TemplateError::CyclicDependency { members } = creation_order(&dependencies).unwrap_err() else {
            panic!("expected cycle");
        };
        assert_eq!(members, vec!["X", "Y", "Z", "X"]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let dependencies = map(&[("A", &["A"])]);
        let TemplateError::CyclicDependency { members } = creation_order(&dependencies).unwrap_err() else {
            panic!("expected cycle");
        };
        assert_eq!(members, vec!["A", "A"]);
    }

    #[test]
    fn ready_and_transitive_dependents() {
        let dependencies = map(&[("VPC", &[]), ("Subnet", &["VPC"]), ("Instance", &["Subnet"]), ("Gateway", &[])]);
        assert_eq!(ready(&dependencies, &HashSet::new()), vec!["VPC", "Gateway"]);
        let completed = HashSet::from(["VPC".to_string()]);
        assert_eq!(ready(&dependencies, &completed), vec!["Subnet", "Gateway"]);

        let dependents: Vec<String> = transitive_dependents(&dependencies, "VPC").into_iter().collect();
        assert_eq!(dependents, vec!["Subnet", "Instance"]);
    }

    #[test]
    fn work_queue_drained_serially_matches_creation_order() {
        let dependencies = map(&[("C", &["A"]), ("A", &[]), ("B", &[]), ("D", &["B", "C"])]);
        let mut queue = WorkQueue::for_creation(&dependencies).unwrap();
        let mut drained = Vec::new();
        while let Some(id) = queue.pop_ready() {
            queue.complete(&id);
            drained.push(id);
        }
        assert_eq!(drained, creation_order(&dependencies).unwrap());
        assert!(queue.is_drained());
    }

    #[test]
    fn work_queue_for_deletion_waits_for_dependents() {
        let dependencies = map(&[("VPC", &[]), ("Subnet", &["VPC"]), ("Gateway", &[])]);
        let mut queue = WorkQueue::for_deletion(&dependencies).unwrap();
        assert_eq!(queue.pop_ready().as_deref(), Some("Gateway"));
        assert_eq!(queue.pop_ready().as_deref(), Some("Subnet"));
        assert!(!queue.has_ready());
        queue.complete("Subnet");
        assert_eq!(queue.pop_ready().as_deref(), Some("VPC"));
    }

    #[test]
    fn work_queue_failure_blocks_transitive_dependents_only() {
        let dependencies = map(&[
            ("VPC", &[]),
            ("Subnet", &["VPC"]),
            ("Instance", &["Subnet"]),
            ("Gateway", &[]),
        ]);
        let mut queue = WorkQueue::for_creation(&dependencies).unwrap();
        assert_eq!(queue.pop_ready().as_deref(), Some("VPC"));
        let blocked = queue.fail("VPC");
        assert_eq!(blocked, vec!["Subnet", "Instance"]);
        assert_eq!(queue.pop_ready().as_deref(), Some("Gateway"));
        assert!(queue.pop_ready().is_none());
    }

    #[test]
    fn work_queue_drain_withdraws_waiting_nodes() {
        let dependencies = map(&[("A", &[]), ("B", &["A"]), ("C", &[])]);
        let mut queue = WorkQueue::for_creation(&dependencies).unwrap();
        assert_eq!(queue.pop_ready().as_deref(), Some("A"));
        assert_eq!(queue.drain_undispatched(), vec!["B", "C"]);
        assert!(queue.pop_ready().is_none());
        assert!(queue.is_drained());
    }
}
