//! Diff engine for comparing declared and applied graphs.
//!
//! The diff is per resource: every id in either graph gets exactly one
//! [`ResourceDiff`], with property-level details for updates.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::PlanError;
use crate::graph::{
    GraphHasher, KindSchema, PropertyValue, ResourceDeclaration, ResourceGraph, ResourceKind,
};

/// Engine for computing diffs between two resource graphs.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Content hasher.
    hasher: GraphHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    /// Resource id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Changed properties (updates only).
    pub details: Vec<DiffDetail>,
    /// Hash of the applied declaration, if any.
    pub old_hash: Option<String>,
    /// Hash of the declared resource, if any.
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated in place.
    Update,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// A single changed property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffDetail {
    /// Property name.
    pub property: String,
    /// Applied value (`None` if the property is being added).
    pub old_value: Option<PropertyValue>,
    /// Declared value (`None` if the property is being removed).
    pub new_value: Option<PropertyValue>,
}

/// Complete diff result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffResult {
    /// All resource diffs: declared resources in declaration order, then
    /// removed resources in their applied order.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: GraphHasher::new(),
        }
    }

    /// Computes the diff from `previous` (the applied graph) to `current`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::ImmutableKindChange`] if an id changed kind and
    /// [`PlanError::ImmutableProperty`] if an update touches an immutable
    /// property.
    pub fn compute_diff(
        &self,
        current: &ResourceGraph,
        previous: Option<&ResourceGraph>,
    ) -> Result<DiffResult, PlanError> {
        let mut diffs = Vec::with_capacity(current.len());

        for decl in current.declarations() {
            let applied = previous.and_then(|p| p.get(&decl.id));
            diffs.push(self.diff_resource(decl, applied)?);
        }

        if let Some(previous) = previous {
            for old in previous.declarations() {
                if !current.contains(&old.id) {
                    debug!("Resource {} is no longer declared", old.id);
                    diffs.push(ResourceDiff {
                        id: old.id.clone(),
                        kind: old.kind,
                        diff_type: DiffType::Delete,
                        details: Vec::new(),
                        old_hash: Some(self.hasher.hash_declaration(old)),
                        new_hash: None,
                    });
                }
            }
        }

        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        let creates = count(DiffType::Create);
        let updates = count(DiffType::Update);
        let deletes = count(DiffType::Delete);
        let unchanged = count(DiffType::NoChange);

        Ok(DiffResult {
            diffs,
            creates,
            updates,
            deletes,
            unchanged,
        })
    }

    fn diff_resource(
        &self,
        decl: &ResourceDeclaration,
        applied: Option<&ResourceDeclaration>,
    ) -> Result<ResourceDiff, PlanError> {
        let new_hash = self.hasher.hash_declaration(decl);

        let Some(applied) = applied else {
            debug!("Resource {} needs to be created", decl.id);
            return Ok(ResourceDiff {
                id: decl.id.clone(),
                kind: decl.kind,
                diff_type: DiffType::Create,
                details: Vec::new(),
                old_hash: None,
                new_hash: Some(new_hash),
            });
        };

        if applied.kind != decl.kind {
            return Err(PlanError::ImmutableKindChange {
                id: decl.id.clone(),
                before: applied.kind,
                after: decl.kind,
            });
        }

        let old_hash = self.hasher.hash_declaration(applied);
        if old_hash == new_hash {
            debug!("Resource {} is up to date", decl.id);
            return Ok(ResourceDiff {
                id: decl.id.clone(),
                kind: decl.kind,
                diff_type: DiffType::NoChange,
                details: Vec::new(),
                old_hash: Some(old_hash),
                new_hash: Some(new_hash),
            });
        }

        let details = Self::property_changes(applied, decl);
        let schema = KindSchema::for_kind(decl.kind);
        if let Some(detail) = details.iter().find(|d| schema.is_immutable(&d.property)) {
            return Err(PlanError::ImmutableProperty {
                id: decl.id.clone(),
                kind: decl.kind,
                property: detail.property.clone(),
            });
        }

        debug!(
            "Resource {} needs update ({} propert{})",
            decl.id,
            details.len(),
            if details.len() == 1 { "y" } else { "ies" }
        );
        Ok(ResourceDiff {
            id: decl.id.clone(),
            kind: decl.kind,
            diff_type: DiffType::Update,
            details,
            old_hash: Some(old_hash),
            new_hash: Some(new_hash),
        })
    }

    /// Lists properties that were changed, added or removed, in name order.
    fn property_changes(before: &ResourceDeclaration, after: &ResourceDeclaration) -> Vec<DiffDetail> {
        let names: BTreeSet<&String> = before
            .properties
            .keys()
            .chain(after.properties.keys())
            .collect();

        names
            .into_iter()
            .filter_map(|name| {
                let old_value = before.properties.get(name);
                let new_value = after.properties.get(name);
                (old_value != new_value).then(|| DiffDetail {
                    property: name.clone(),
                    old_value: old_value.cloned(),
                    new_value: new_value.cloned(),
                })
            })
            .collect()
    }
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.deletes > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .collect()
    }

    /// Indexes the diffs by resource id.
    #[must_use]
    pub fn by_id(&self) -> HashMap<&str, &ResourceDiff> {
        self.diffs.iter().map(|d| (d.id.as_str(), d)).collect()
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.id, self.diff_type)?;
        if !self.details.is_empty() {
            let fields: Vec<&str> = self.details.iter().map(|d| d.property.as_str()).collect();
            write!(f, " ({})", fields.join(", "))?;
        }
        Ok(())
    }
}
