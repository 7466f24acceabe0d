//! Change plan types and construction.
//!
//! A plan is the ordered list of operations that moves a stack from its
//! applied graph to its declared graph. Creates and updates come first, in
//! dependency order of the declared graph; deletes follow, in reverse
//! dependency order of the applied graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PlanError;
use crate::graph::{GraphHasher, Properties, ResourceGraph, ResourceKind};
use crate::state::AppliedState;

use super::diff::{DiffEngine, DiffType};

/// Type of a planned operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    /// Provision a new resource.
    Create,
    /// Change an existing resource in place.
    Update,
    /// Remove a resource.
    Delete,
}

/// A single planned operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// What to do.
    pub operation: OperationType,
    /// Target resource id.
    pub id: String,
    /// Target resource kind.
    pub kind: ResourceKind,
    /// Applied properties (updates and deletes).
    pub before: Option<Properties>,
    /// Declared properties (creates and updates).
    pub after: Option<Properties>,
}

/// An ordered change plan for one stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePlan {
    /// Stack name.
    pub stack: String,
    /// When the plan was computed.
    pub created_at: DateTime<Utc>,
    /// Content hash of the declared graph.
    pub graph_hash: String,
    /// Revision of the applied state the plan was computed against.
    pub base_revision: Option<u64>,
    /// Graph hash of that applied state.
    pub base_hash: Option<String>,
    /// Operations in execution order.
    pub operations: Vec<Operation>,
}

/// Computes the ordered operations that turn `previous` into `current`.
///
/// # Errors
///
/// Returns a [`PlanError`] if a resource changed kind or an update touches an
/// immutable property.
pub fn plan(
    current: &ResourceGraph,
    previous: Option<&ResourceGraph>,
) -> Result<Vec<Operation>, PlanError> {
    let diff = DiffEngine::new().compute_diff(current, previous)?;
    if !diff.has_changes() {
        return Ok(Vec::new());
    }
    let by_id = diff.by_id();
    let mut operations = Vec::with_capacity(diff.total_changes());

    for decl in current.topological_order() {
        let operation = match by_id.get(decl.id.as_str()).map(|d| d.diff_type) {
            Some(DiffType::Create) => Operation {
                operation: OperationType::Create,
                id: decl.id.clone(),
                kind: decl.kind,
                before: None,
                after: Some(decl.properties.clone()),
            },
            Some(DiffType::Update) => Operation {
                operation: OperationType::Update,
                id: decl.id.clone(),
                kind: decl.kind,
                before: previous
                    .and_then(|p| p.get(&decl.id))
                    .map(|old| old.properties.clone()),
                after: Some(decl.properties.clone()),
            },
            _ => continue,
        };
        operations.push(operation);
    }

    if let Some(previous) = previous {
        for old in previous.topological_order().into_iter().rev() {
            if by_id.get(old.id.as_str()).map(|d| d.diff_type) == Some(DiffType::Delete) {
                operations.push(Operation {
                    operation: OperationType::Delete,
                    id: old.id.clone(),
                    kind: old.kind,
                    before: Some(old.properties.clone()),
                    after: None,
                });
            }
        }
    }

    debug!("Planned {} operation(s)", operations.len());
    Ok(operations)
}

impl ChangePlan {
    /// Computes the plan for `stack` against its applied state.
    ///
    /// # Errors
    ///
    /// Returns a [`PlanError`] if the change cannot be expressed as a plan.
    pub fn compute(
        stack: &str,
        current: &ResourceGraph,
        previous: Option<&AppliedState>,
    ) -> Result<Self, PlanError> {
        let operations = plan(current, previous.map(|s| &s.resources))?;
        let plan = Self {
            stack: stack.to_string(),
            created_at: Utc::now(),
            graph_hash: GraphHasher::new().hash_graph(current),
            base_revision: previous.map(|s| s.revision),
            base_hash: previous.map(|s| s.graph_hash.clone()),
            operations,
        };

        info!(
            "Plan for stack '{stack}': {} to create, {} to update, {} to delete",
            plan.create_count(),
            plan.update_count(),
            plan.delete_count()
        );
        Ok(plan)
    }

    /// Returns true if the plan is empty (no changes).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Returns the number of operations.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns the number of creates.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(OperationType::Create)
    }

    /// Returns the number of updates.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(OperationType::Update)
    }

    /// Returns the number of deletes.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(OperationType::Delete)
    }

    fn count(&self, kind: OperationType) -> usize {
        self.operations
            .iter()
            .filter(|op| op.operation == kind)
            .count()
    }
}

impl Operation {
    /// Short label such as `CREATE web1`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{} {}", self.operation, self.id)
    }

    /// Human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self.operation {
            OperationType::Create => format!("Create {} '{}'", self.kind, self.id),
            OperationType::Update => format!("Update {} '{}' in place", self.kind, self.id),
            OperationType::Delete => format!("Delete {} '{}'", self.kind, self.id),
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.operation, self.id, self.kind)
    }
}

impl std::fmt::Display for ChangePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.operations.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Change plan for '{}' ({} operations):", self.stack, self.operations.len())?;
        for (i, op) in self.operations.iter().enumerate() {
            writeln!(f, "  {}. {op}", i + 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceDeclaration;

    fn blog(with_rule: bool) -> ResourceGraph {
        let mut decls = vec![
            ResourceDeclaration::new("net1", ResourceKind::Network).cidr("cidr", "10.0.0.0/16"),
            ResourceDeclaration::new("web1", ResourceKind::Instance).reference("network", "net1"),
            ResourceDeclaration::new("db1", ResourceKind::Database).reference("network", "net1"),
        ];
        if with_rule {
            decls.push(
                ResourceDeclaration::new("rule1", ResourceKind::AccessRule)
                    .reference("source", "web1")
                    .reference("target", "db1")
                    .integer("port", 3306),
            );
        }
        ResourceGraph::build(decls).unwrap()
    }

    fn labels(ops: &[Operation]) -> Vec<String> {
        ops.iter().map(Operation::label).collect()
    }

    #[test]
    fn test_initial_plan_creates_in_dependency_order() {
        let ops = plan(&blog(true), None).unwrap();
        assert_eq!(
            labels(&ops),
            vec!["CREATE net1", "CREATE web1", "CREATE db1", "CREATE rule1"]
        );
        assert!(ops.iter().all(|op| op.before.is_none() && op.after.is_some()));
    }

    #[test]
    fn test_same_graph_plans_nothing() {
        let graph = blog(true);
        assert!(plan(&graph, Some(&graph)).unwrap().is_empty());
    }

    #[test]
    fn test_removing_rule_plans_single_delete() {
        let ops = plan(&blog(false), Some(&blog(true))).unwrap();
        assert_eq!(labels(&ops), vec!["DELETE rule1"]);
        assert!(ops[0].after.is_none());
    }

    #[test]
    fn test_destroy_deletes_dependents_first() {
        let ops = plan(&ResourceGraph::empty(), Some(&blog(true))).unwrap();
        assert_eq!(
            labels(&ops),
            vec!["DELETE rule1", "DELETE db1", "DELETE web1", "DELETE net1"]
        );
    }

    #[test]
    fn test_updates_precede_deletes() {
        // rule1 moves from web1 to web2; web1 can only go once the rule no
        // longer references it.
        let current = ResourceGraph::build(vec![
            ResourceDeclaration::new("net1", ResourceKind::Network).cidr("cidr", "10.0.0.0/16"),
            ResourceDeclaration::new("web2", ResourceKind::Instance).reference("network", "net1"),
            ResourceDeclaration::new("db1", ResourceKind::Database).reference("network", "net1"),
            ResourceDeclaration::new("rule1", ResourceKind::AccessRule)
                .reference("source", "web2")
                .reference("target", "db1")
                .integer("port", 3306),
        ])
        .unwrap();

        let ops = plan(&current, Some(&blog(true))).unwrap();
        assert_eq!(
            labels(&ops),
            vec!["CREATE web2", "UPDATE rule1", "DELETE web1"]
        );
    }

    #[test]
    fn test_update_carries_before_and_after() {
        let previous = blog(true);
        let current = ResourceGraph::build(
            previous
                .declarations()
                .iter()
                .cloned()
                .map(|d| if d.id == "web1" { d.text("size", "t2.large") } else { d })
                .collect(),
        )
        .unwrap();

        let ops = plan(&current, Some(&previous)).unwrap();
        assert_eq!(labels(&ops), vec!["UPDATE web1"]);
        assert!(ops[0].before.as_ref().unwrap().get("size").is_none());
        assert!(ops[0].after.as_ref().unwrap().contains_key("size"));
    }

    #[test]
    fn test_change_plan_metadata() {
        let first = AppliedState::next("blog", None, blog(false));
        let plan = ChangePlan::compute("blog", &blog(true), Some(&first)).unwrap();

        assert_eq!(plan.base_revision, Some(1));
        assert_eq!(plan.base_hash.as_deref(), Some(first.graph_hash.as_str()));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.create_count(), 1);
        assert!(plan.to_string().contains("1. CREATE rule1 (ACCESS_RULE)"));

        let json = serde_json::to_value(&plan.operations).unwrap();
        assert_eq!(json[0]["operation"], "CREATE");
        assert_eq!(json[0]["kind"], "ACCESS_RULE");
        assert!(json[0]["before"].is_null());
    }
}
