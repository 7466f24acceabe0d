//! Resource graph validation.
//!
//! The validator walks every declaration of a built graph and collects every
//! problem it finds instead of stopping at the first one, so a stack author
//! sees the whole list in one pass.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

use super::builder::ResourceGraph;
use super::cidr::Cidr;
use super::declaration::{PropertyValue, ResourceDeclaration, ResourceKind};
use super::schema::{DATABASE_SIZES, INSTANCE_SIZES, KindSchema, PropertySpec, ValueType};
use crate::error::GraphError;

/// Machine-readable category of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    /// The resource id is malformed.
    InvalidId,
    /// A required property is absent.
    MissingProperty,
    /// The property is not part of the kind's schema.
    UnknownProperty,
    /// The value has the wrong type.
    TypeMismatch,
    /// The value is not a valid network range.
    InvalidCidr,
    /// A port outside `[1, 65535]`.
    PortOutOfRange,
    /// An integer outside its allowed range.
    ValueOutOfRange,
    /// A string outside its allowed set.
    InvalidEnumValue,
    /// A reference points at a resource of a kind the property does not accept.
    InvalidReferenceKind,
    /// A reference on a property that does not accept references.
    UnexpectedReference,
    /// A resource references more than one network.
    MultipleNetworks,
    /// An access rule whose source and target are the same resource.
    SelfReference,
    /// An access rule between resources in different networks.
    CrossNetworkRule,
}

/// A single problem found by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Id of the offending resource.
    pub id: String,
    /// Offending property, if the issue concerns one.
    pub property: Option<String>,
    /// Issue category.
    pub code: IssueCode,
    /// Human-readable description.
    pub message: String,
}

/// Validator for resource graphs.
#[derive(Debug, Clone)]
pub struct GraphValidator {
    instance_sizes: BTreeSet<String>,
    database_sizes: BTreeSet<String>,
}

impl IssueCode {
    /// Returns the wire name of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidId => "INVALID_ID",
            Self::MissingProperty => "MISSING_PROPERTY",
            Self::UnknownProperty => "UNKNOWN_PROPERTY",
            Self::TypeMismatch => "TYPE_MISMATCH",
            Self::InvalidCidr => "INVALID_CIDR",
            Self::PortOutOfRange => "PORT_OUT_OF_RANGE",
            Self::ValueOutOfRange => "VALUE_OUT_OF_RANGE",
            Self::InvalidEnumValue => "INVALID_ENUM_VALUE",
            Self::InvalidReferenceKind => "INVALID_REFERENCE_KIND",
            Self::UnexpectedReference => "UNEXPECTED_REFERENCE",
            Self::MultipleNetworks => "MULTIPLE_NETWORKS",
            Self::SelfReference => "SELF_REFERENCE",
            Self::CrossNetworkRule => "CROSS_NETWORK_RULE",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.property {
            Some(property) => {
                write!(f, "{}.{}: [{}] {}", self.id, property, self.code, self.message)
            }
            None => write!(f, "{}: [{}] {}", self.id, self.code, self.message),
        }
    }
}

impl ValidationIssue {
    fn new(
        decl: &ResourceDeclaration,
        property: Option<&str>,
        code: IssueCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: decl.id.clone(),
            property: property.map(String::from),
            code,
            message: message.into(),
        }
    }
}

impl Default for GraphValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphValidator {
    /// Creates a validator with the default size lists.
    #[must_use]
    pub fn new() -> Self {
        Self {
            instance_sizes: INSTANCE_SIZES.iter().map(|s| (*s).to_string()).collect(),
            database_sizes: DATABASE_SIZES.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// Adds an allowed size for a kind.
    ///
    /// Returns false if the kind has no size property.
    pub fn add_size(&mut self, kind: ResourceKind, size: impl Into<String>) -> bool {
        let sizes = match kind {
            ResourceKind::Instance => &mut self.instance_sizes,
            ResourceKind::Database => &mut self.database_sizes,
            ResourceKind::Network | ResourceKind::AccessRule => return false,
        };
        sizes.insert(size.into());
        true
    }

    /// Validates a graph and returns every issue found. An empty list means
    /// the graph is valid.
    #[must_use]
    pub fn validate(&self, graph: &ResourceGraph) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for decl in graph.declarations() {
            Self::check_id(decl, &mut issues);
            self.check_properties(graph, decl, &mut issues);
            match decl.kind {
                ResourceKind::Instance | ResourceKind::Database => {
                    Self::check_network_count(graph, decl, &mut issues);
                }
                ResourceKind::AccessRule => Self::check_access_rule(graph, decl, &mut issues),
                ResourceKind::Network => {}
            }
        }

        debug!(
            resources = graph.len(),
            issues = issues.len(),
            "Graph validation finished"
        );
        issues
    }

    /// Validates a graph and fails if any issue is found.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::ValidationFailed`] carrying every issue.
    pub fn validate_strict(&self, graph: &ResourceGraph) -> Result<(), GraphError> {
        let issues = self.validate(graph);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(GraphError::ValidationFailed { issues })
        }
    }

    fn check_id(decl: &ResourceDeclaration, issues: &mut Vec<ValidationIssue>) {
        if !is_valid_id(&decl.id) {
            issues.push(ValidationIssue::new(
                decl,
                None,
                IssueCode::InvalidId,
                format!(
                    "Resource id '{}' is invalid. Must start with a letter and contain only letters, digits, '-' or '_'.",
                    decl.id
                ),
            ));
        }
    }

    fn check_properties(
        &self,
        graph: &ResourceGraph,
        decl: &ResourceDeclaration,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let schema = KindSchema::for_kind(decl.kind);

        for spec in schema.required() {
            if decl.property(spec.name).is_none() {
                issues.push(ValidationIssue::new(
                    decl,
                    Some(spec.name),
                    IssueCode::MissingProperty,
                    format!("{} requires property '{}'", decl.kind, spec.name),
                ));
            }
        }

        for (name, value) in &decl.properties {
            match schema.property(name) {
                Some(spec) => self.check_value(graph, decl, spec, value, issues),
                None if value.as_reference().is_some() => issues.push(ValidationIssue::new(
                    decl,
                    Some(name),
                    IssueCode::UnexpectedReference,
                    format!("Property '{name}' is not a reference property of {}", decl.kind),
                )),
                None => issues.push(ValidationIssue::new(
                    decl,
                    Some(name),
                    IssueCode::UnknownProperty,
                    format!("{} has no property '{name}'", decl.kind),
                )),
            }
        }
    }

    fn check_value(
        &self,
        graph: &ResourceGraph,
        decl: &ResourceDeclaration,
        spec: &PropertySpec,
        value: &PropertyValue,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let property = Some(spec.name);
        let mut report = |code: IssueCode, message: String| {
            issues.push(ValidationIssue::new(decl, property, code, message));
        };

        match (spec.value_type, value) {
            (ValueType::Reference(allowed), PropertyValue::Reference(target)) => {
                if let Some(referenced) = graph.get(target)
                    && !allowed.contains(&referenced.kind)
                {
                    report(
                        IssueCode::InvalidReferenceKind,
                        format!(
                            "'{}' must reference {}, but '{target}' is a {}",
                            spec.name,
                            describe(spec.value_type),
                            referenced.kind
                        ),
                    );
                }
            }
            (ValueType::Reference(_), other) => report(
                IssueCode::TypeMismatch,
                format!(
                    "'{}' must be a reference to {}, got {}",
                    spec.name,
                    describe(spec.value_type),
                    other.type_name()
                ),
            ),
            (_, PropertyValue::Reference(target)) => report(
                IssueCode::UnexpectedReference,
                format!(
                    "'{}' does not accept references (got ref '{target}'), expected {}",
                    spec.name,
                    describe(spec.value_type)
                ),
            ),
            (ValueType::Text, PropertyValue::String(_)) => {}
            (ValueType::Integer { min, max }, PropertyValue::Integer(n)) => {
                if !(min..=max).contains(n) {
                    report(
                        IssueCode::ValueOutOfRange,
                        format!("'{}' must be between {min} and {max}, got {n}", spec.name),
                    );
                }
            }
            (ValueType::Port, PropertyValue::Integer(port)) => {
                if !(1..=65535).contains(port) {
                    report(
                        IssueCode::PortOutOfRange,
                        format!("'{}' must be between 1 and 65535, got {port}", spec.name),
                    );
                }
            }
            (ValueType::Cidr, PropertyValue::Cidr(range)) => {
                if let Err(e) = Cidr::parse(range) {
                    report(
                        IssueCode::InvalidCidr,
                        format!("'{range}' is not a valid network range: {e}"),
                    );
                }
            }
            (ValueType::Choice(options), PropertyValue::String(choice)) => {
                if !options.contains(&choice.as_str()) {
                    report(
                        IssueCode::InvalidEnumValue,
                        format!(
                            "'{choice}' is not a valid {}. Expected one of: {}",
                            spec.name,
                            options.join(", ")
                        ),
                    );
                }
            }
            (ValueType::Size, PropertyValue::String(size)) => {
                if let Some(allowed) = self.sizes_for(decl.kind)
                    && !allowed.contains(size)
                {
                    report(
                        IssueCode::InvalidEnumValue,
                        format!(
                            "'{size}' is not a known {} size. Expected one of: {}",
                            decl.kind,
                            allowed.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
                        ),
                    );
                }
            }
            (expected, actual) => report(
                IssueCode::TypeMismatch,
                format!(
                    "'{}' must be {}, got {}",
                    spec.name,
                    describe(expected),
                    actual.type_name()
                ),
            ),
        }
    }

    fn check_network_count(
        graph: &ResourceGraph,
        decl: &ResourceDeclaration,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let networks: BTreeSet<&str> = decl
            .references()
            .filter(|(_, target)| {
                graph
                    .get(target)
                    .is_some_and(|r| r.kind == ResourceKind::Network)
            })
            .map(|(_, target)| target)
            .collect();

        if networks.len() > 1 {
            let names: Vec<&str> = networks.into_iter().collect();
            issues.push(ValidationIssue::new(
                decl,
                None,
                IssueCode::MultipleNetworks,
                format!(
                    "{} may reference at most one network, found: {}",
                    decl.kind,
                    names.join(", ")
                ),
            ));
        }
    }

    fn check_access_rule(
        graph: &ResourceGraph,
        decl: &ResourceDeclaration,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let source = decl.property("source").and_then(PropertyValue::as_reference);
        let target = decl.property("target").and_then(PropertyValue::as_reference);
        let (Some(source), Some(target)) = (source, target) else {
            return;
        };

        if source == target {
            issues.push(ValidationIssue::new(
                decl,
                Some("target"),
                IssueCode::SelfReference,
                format!("Access rule source and target are both '{source}'"),
            ));
            return;
        }

        let source_net = network_of(graph, source);
        let target_net = network_of(graph, target);
        if let (Some(source_net), Some(target_net)) = (source_net, target_net)
            && source_net != target_net
        {
            issues.push(ValidationIssue::new(
                decl,
                Some("target"),
                IssueCode::CrossNetworkRule,
                format!(
                    "'{source}' is in network '{source_net}' but '{target}' is in network '{target_net}'"
                ),
            ));
        }
    }

    fn sizes_for(&self, kind: ResourceKind) -> Option<&BTreeSet<String>> {
        match kind {
            ResourceKind::Instance => Some(&self.instance_sizes),
            ResourceKind::Database => Some(&self.database_sizes),
            ResourceKind::Network | ResourceKind::AccessRule => None,
        }
    }
}

/// Returns true if `id` starts with an ASCII letter and continues with ASCII
/// letters, digits, `-` or `_`.
#[must_use]
pub fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn network_of<'a>(graph: &'a ResourceGraph, id: &str) -> Option<&'a str> {
    graph
        .get(id)?
        .property("network")
        .and_then(PropertyValue::as_reference)
}

fn describe(value_type: ValueType) -> String {
    match value_type {
        ValueType::Text => String::from("a string"),
        ValueType::Integer { min, max } => format!("an integer in {min}..={max}"),
        ValueType::Port => String::from("a port number"),
        ValueType::Cidr => String::from("a CIDR range"),
        ValueType::Choice(options) => format!("one of {}", options.join(", ")),
        ValueType::Size => String::from("a size name"),
        ValueType::Reference(kinds) => kinds
            .iter()
            .copied()
            .map(ResourceKind::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
    }
}
