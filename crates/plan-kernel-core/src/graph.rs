//! Programs and the cross-plan dependency graph.
//!
//! Nodes are plans. An edge `source -> target` means the target waits on a
//! phase of the source plan.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{KernelError, PlanId, ProgramId, WorkspaceId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    Active,
    Archived,
}

impl ProgramStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Program {
    pub id: ProgramId,
    pub workspace_id: WorkspaceId,
    pub title: String,
    pub description: String,
    pub status: ProgramStatus,
    /// Child plans in manifest order.
    pub manifest: Vec<PlanId>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Program {
    #[must_use]
    pub fn contains(&self, plan_id: &PlanId) -> bool {
        self.manifest.contains(plan_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Blocks,
    Informs,
}

impl DependencyType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Informs => "informs",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "blocks" => Some(Self::Blocks),
            "informs" => Some(Self::Informs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    Pending,
    Satisfied,
}

impl DependencyStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Satisfied => "satisfied",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "satisfied" => Some(Self::Satisfied),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgramDependency {
    pub id: i64,
    pub program_id: ProgramId,
    pub source_plan_id: PlanId,
    pub source_phase: String,
    pub target_plan_id: PlanId,
    /// `None` means the whole target plan waits.
    pub target_phase: Option<String>,
    pub dependency_type: DependencyType,
    pub status: DependencyStatus,
    pub created_at: OffsetDateTime,
    pub satisfied_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewDependency {
    pub source_plan_id: PlanId,
    pub source_phase: String,
    pub target_plan_id: PlanId,
    #[serde(default)]
    pub target_phase: Option<String>,
    pub dependency_type: DependencyType,
}

impl NewDependency {
    /// # Errors
    /// Returns [`KernelError::Validation`] for a blank source phase or a
    /// self-dependency.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.source_phase.trim().is_empty() {
            return Err(KernelError::Validation(
                "dependency source_phase MUST be provided".to_string(),
            ));
        }
        if self.source_plan_id == self.target_plan_id {
            return Err(KernelError::Validation(format!(
                "plan {} cannot depend on itself",
                self.source_plan_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphValidation {
    pub acyclic: bool,
    pub cycle: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PhaseCompletionReport {
    pub plan_id: Option<PlanId>,
    pub phase: String,
    pub phase_complete: bool,
    pub satisfied_dependencies: Vec<i64>,
    pub unblocked_plans: Vec<PlanId>,
}

fn adjacency<'a>(
    edges: impl Iterator<Item = (&'a PlanId, &'a PlanId)>,
) -> BTreeMap<&'a PlanId, BTreeSet<&'a PlanId>> {
    let mut graph: BTreeMap<&PlanId, BTreeSet<&PlanId>> = BTreeMap::new();
    for (source, target) in edges {
        graph.entry(source).or_default().insert(target);
    }
    graph
}

/// Rejects a candidate edge that would close a cycle.
///
/// Walks depth-first from `target` over the existing edges plus the
/// candidate; reaching `source` means the candidate closes a loop.
///
/// # Errors
/// Returns [`KernelError::Validation`] for a self-edge and
/// [`KernelError::CycleDetected`] with the closing path otherwise.
pub fn check_candidate_edge(
    existing: &[ProgramDependency],
    source: &PlanId,
    target: &PlanId,
) -> Result<(), KernelError> {
    if source == target {
        return Err(KernelError::Validation(format!(
            "plan {source} cannot depend on itself"
        )));
    }

    let graph = adjacency(
        existing
            .iter()
            .map(|edge| (&edge.source_plan_id, &edge.target_plan_id))
            .chain(std::iter::once((source, target))),
    );

    let mut parent: BTreeMap<&PlanId, &PlanId> = BTreeMap::new();
    let mut visited: BTreeSet<&PlanId> = BTreeSet::new();
    let mut stack = vec![target];

    while let Some(current) = stack.pop() {
        if current == source {
            let mut path = vec![source.to_string()];
            let mut cursor = current;
            while let Some(previous) = parent.get(cursor) {
                path.push(previous.to_string());
                cursor = previous;
            }
            path.push(source.to_string());
            // Collected backwards from the source; flip to read source -> target -> ... -> source.
            let last = path.len() - 1;
            path[1..last].reverse();
            return Err(KernelError::CycleDetected { path });
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(next) = graph.get(current) {
            for neighbour in next {
                if !visited.contains(neighbour) {
                    parent.entry(neighbour).or_insert(current);
                    stack.push(neighbour);
                }
            }
        }
    }

    Ok(())
}

/// Full-graph cycle search; returns one cycle if the edge set has any.
#[must_use]
pub fn find_cycle(edges: &[ProgramDependency]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let graph = adjacency(
        edges
            .iter()
            .map(|edge| (&edge.source_plan_id, &edge.target_plan_id)),
    );
    let mut marks: BTreeMap<&PlanId, Mark> = BTreeMap::new();

    for root in graph.keys() {
        if marks.contains_key(root) {
            continue;
        }
        let mut path: Vec<&PlanId> = Vec::new();
        let mut stack: Vec<(&PlanId, bool)> = vec![(root, false)];
        while let Some((node, leaving)) = stack.pop() {
            if leaving {
                marks.insert(node, Mark::Done);
                path.pop();
                continue;
            }
            match marks.get(node) {
                Some(Mark::Done) => continue,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|item| *item == node).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(ToString::to_string).collect();
                    cycle.push(node.to_string());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            path.push(node);
            stack.push((node, true));
            if let Some(next) = graph.get(node) {
                for neighbour in next.iter().rev() {
                    if marks.get(neighbour) != Some(&Mark::Done) {
                        stack.push((neighbour, false));
                    }
                }
            }
        }
    }
    None
}

#[must_use]
pub fn validate_no_cycles(edges: &[ProgramDependency]) -> GraphValidation {
    let cycle = find_cycle(edges);
    GraphValidation {
        acyclic: cycle.is_none(),
        cycle,
    }
}

/// Targets of the just-satisfied `blocks` edges whose incoming `blocks`
/// edges are now all satisfied. `edges` must already reflect the flip.
#[must_use]
pub fn unblocked_targets(edges: &[ProgramDependency], flipped: &[i64]) -> Vec<PlanId> {
    let mut seen = BTreeSet::new();
    let mut unblocked = Vec::new();
    for edge in edges.iter().filter(|edge| {
        flipped.contains(&edge.id) && edge.dependency_type == DependencyType::Blocks
    }) {
        let target = &edge.target_plan_id;
        if !seen.insert(target) {
            continue;
        }
        let all_satisfied = edges
            .iter()
            .filter(|other| {
                &other.target_plan_id == target && other.dependency_type == DependencyType::Blocks
            })
            .all(|other| other.status == DependencyStatus::Satisfied);
        if all_satisfied {
            unblocked.push(target.clone());
        }
    }
    unblocked
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn edge(id: i64, source: &str, target: &str) -> ProgramDependency {
        ProgramDependency {
            id,
            program_id: ProgramId::from("prog_fixture"),
            source_plan_id: PlanId::from(source),
            source_phase: "build".to_string(),
            target_plan_id: PlanId::from(target),
            target_phase: None,
            dependency_type: DependencyType::Blocks,
            status: DependencyStatus::Pending,
            created_at: crate::now_utc(),
            satisfied_at: None,
        }
    }

    #[test]
    fn closing_edge_reports_path() {
        let edges = vec![edge(1, "a", "b"), edge(2, "b", "c")];
        let err = check_candidate_edge(&edges, &PlanId::from("c"), &PlanId::from("a"));
        match err {
            Err(KernelError::CycleDetected { path }) => {
                assert_eq!(path, vec!["c", "a", "b", "c"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_validation_error() {
        let err = check_candidate_edge(&[], &PlanId::from("a"), &PlanId::from("a"));
        assert!(matches!(err, Err(KernelError::Validation(_))));
    }

    #[test]
    fn diamond_is_acyclic() {
        let edges = vec![
            edge(1, "a", "b"),
            edge(2, "a", "c"),
            edge(3, "b", "d"),
            edge(4, "c", "d"),
        ];
        assert!(validate_no_cycles(&edges).acyclic);
        assert!(check_candidate_edge(&edges, &PlanId::from("a"), &PlanId::from("d")).is_ok());
    }

    #[test]
    fn find_cycle_detects_stored_loop() {
        let edges = vec![edge(1, "a", "b"), edge(2, "b", "c"), edge(3, "c", "a")];
        let report = validate_no_cycles(&edges);
        assert!(!report.acyclic);
        let cycle = report.cycle.unwrap_or_default();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn target_unblocks_only_when_every_blocker_is_satisfied() {
        let mut edges = vec![edge(1, "a", "c"), edge(2, "b", "c")];
        edges[0].status = DependencyStatus::Satisfied;
        assert!(unblocked_targets(&edges, &[1]).is_empty());

        edges[1].status = DependencyStatus::Satisfied;
        assert_eq!(unblocked_targets(&edges, &[2]), vec![PlanId::from("c")]);
    }

    #[test]
    fn informs_edges_never_unblock() {
        let mut informs = edge(1, "a", "b");
        informs.dependency_type = DependencyType::Informs;
        informs.status = DependencyStatus::Satisfied;
        assert!(unblocked_targets(&[informs], &[1]).is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_closing_edge_is_always_rejected(
            chain in prop::collection::btree_set(0usize..12, 2..6),
            extra in prop::collection::vec((0usize..12, 0usize..12), 0..30),
        ) {
            let chain: Vec<usize> = chain.into_iter().collect();
            let mut pairs: Vec<(usize, usize)> = chain.windows(2).map(|pair| (pair[0], pair[1])).collect();
            pairs.extend(extra.into_iter().filter(|(a, b)| a < b));

            let mut edges: Vec<ProgramDependency> = Vec::new();
            for (counter, (a, b)) in pairs.into_iter().enumerate() {
                let source = format!("p{a}");
                let target = format!("p{b}");
                // Forward-only edges can never close a cycle.
                prop_assert!(check_candidate_edge(&edges, &PlanId::from(source.as_str()), &PlanId::from(target.as_str())).is_ok());
                edges.push(edge(i64::try_from(counter).unwrap_or(i64::MAX), &source, &target));
            }
            prop_assert!(validate_no_cycles(&edges).acyclic);

            let first = format!("p{}", chain[0]);
            let last = format!("p{}", chain[chain.len() - 1]);
            let result = check_candidate_edge(&edges, &PlanId::from(last.as_str()), &PlanId::from(first.as_str()));
            match result {
                Err(KernelError::CycleDetected { path }) => {
                    prop_assert_eq!(path.first(), Some(&last));
                    prop_assert_eq!(path.last(), Some(&last));
                    prop_assert_eq!(path.get(1), Some(&first));
                }
                other => prop_assert!(false, "expected cycle, got {:?}", other),
            }
        }
    }
}
