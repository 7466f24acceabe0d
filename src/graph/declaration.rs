//! Resource declaration types.
//!
//! A declaration is one entry of a stack: a unique id, a kind, and a map of
//! typed properties. References between declarations are ordinary property
//! values and become edges once the graph is built.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::schema::{KindSchema, ValueType};

/// Property map of a declaration, ordered by property name.
pub type Properties = BTreeMap<String, PropertyValue>;

/// Kinds of resources a stack can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    /// A virtual network.
    Network,
    /// A compute instance.
    Instance,
    /// A managed relational database instance.
    Database,
    /// A network-access rule between two resources.
    AccessRule,
}

/// A typed property value.
///
/// On the wire a value is a plain string, a plain integer, `{ "cidr": ... }`
/// or `{ "ref": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawValue", into = "RawValue")]
pub enum PropertyValue {
    /// Free-form string.
    String(String),
    /// Signed integer.
    Integer(i64),
    /// Network range in CIDR notation.
    Cidr(String),
    /// Id of another declaration in the same stack.
    Reference(String),
}

/// Wire representation of a property value.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Integer(i64),
    Text(String),
    Tagged(TaggedValue),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TaggedValue {
    Ref(String),
    Cidr(String),
}

/// A single resource declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    /// Unique id within the stack.
    pub id: String,
    /// Resource kind. Never changes for a given id.
    pub kind: ResourceKind,
    /// Kind-specific properties.
    #[serde(default)]
    pub properties: Properties,
}

impl ResourceKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 4] = [Self::Network, Self::Instance, Self::Database, Self::AccessRule];

    /// Returns the wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::Instance => "INSTANCE",
            Self::Database => "DATABASE",
            Self::AccessRule => "ACCESS_RULE",
        }
    }
}

impl PropertyValue {
    /// Returns the referenced id if this value is a reference.
    #[must_use]
    pub fn as_reference(&self) -> Option<&str> {
        match self {
            Self::Reference(id) => Some(id),
            _ => None,
        }
    }

    /// Returns the integer if this value is an integer.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string if this value is a plain string.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns a short name for the value type, used in messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Integer(_) => "integer",
            Self::Cidr(_) => "cidr",
            Self::Reference(_) => "reference",
        }
    }
}

impl ResourceDeclaration {
    /// Creates a declaration with no properties.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            properties: Properties::new(),
        }
    }

    /// Sets a property value.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Sets a string property.
    #[must_use]
    pub fn text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(name, PropertyValue::String(value.into()))
    }

    /// Sets an integer property.
    #[must_use]
    pub fn integer(self, name: impl Into<String>, value: i64) -> Self {
        self.with(name, PropertyValue::Integer(value))
    }

    /// Sets a CIDR property.
    #[must_use]
    pub fn cidr(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(name, PropertyValue::Cidr(value.into()))
    }

    /// Sets a reference property.
    #[must_use]
    pub fn reference(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.with(name, PropertyValue::Reference(target.into()))
    }

    /// Gets a property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Iterates over `(property, target id)` pairs for every reference value.
    pub fn references(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .filter_map(|(name, value)| value.as_reference().map(|target| (name.as_str(), target)))
    }

    /// Converts plain strings into references or CIDR values where the kind's
    /// schema expects one.
    ///
    /// Stack files write `network: net1` rather than `network: { ref: net1 }`;
    /// this is applied once when a stack file is loaded.
    pub fn normalize(&mut self) {
        let schema = KindSchema::for_kind(self.kind);
        for (name, value) in &mut self.properties {
            let PropertyValue::String(text) = value else {
                continue;
            };
            let Some(spec) = schema.property(name) else {
                continue;
            };
            match spec.value_type {
                ValueType::Reference(_) => *value = PropertyValue::Reference(std::mem::take(text)),
                ValueType::Cidr => *value = PropertyValue::Cidr(std::mem::take(text)),
                _ => {}
            }
        }
    }
}

impl From<RawValue> for PropertyValue {
    fn from(raw: RawValue) -> Self {
        match raw {
            RawValue::Integer(n) => Self::Integer(n),
            RawValue::Text(s) => Self::String(s),
            RawValue::Tagged(TaggedValue::Ref(id)) => Self::Reference(id),
            RawValue::Tagged(TaggedValue::Cidr(range)) => Self::Cidr(range),
        }
    }
}

impl From<PropertyValue> for RawValue {
    fn from(value: PropertyValue) -> Self {
        match value {
            PropertyValue::String(s) => Self::Text(s),
            PropertyValue::Integer(n) => Self::Integer(n),
            PropertyValue::Cidr(range) => Self::Tagged(TaggedValue::Cidr(range)),
            PropertyValue::Reference(id) => Self::Tagged(TaggedValue::Ref(id)),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Cidr(range) => write!(f, "{range}"),
            Self::Reference(id) => write!(f, "ref:{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_wire_forms() {
        let yaml = r"
id: rule1
kind: ACCESS_RULE
properties:
  source: { ref: web1 }
  target: db1
  port: 3306
  note: allow mysql
";
        let decl: ResourceDeclaration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(decl.kind, ResourceKind::AccessRule);
        assert_eq!(
            decl.property("source"),
            Some(&PropertyValue::Reference(String::from("web1")))
        );
        // Plain strings stay strings until normalized.
        assert_eq!(decl.property("target"), Some(&PropertyValue::String(String::from("db1"))));
        assert_eq!(decl.property("port"), Some(&PropertyValue::Integer(3306)));
    }

    #[test]
    fn test_normalize_follows_schema() {
        let mut decl = ResourceDeclaration::new("web1", ResourceKind::Instance)
            .text("network", "net1")
            .text("image", "amazon-linux-2");
        decl.normalize();

        assert_eq!(decl.property("network").and_then(PropertyValue::as_reference), Some("net1"));
        assert_eq!(decl.property("image").and_then(PropertyValue::as_text), Some("amazon-linux-2"));

        let mut net = ResourceDeclaration::new("net1", ResourceKind::Network).text("cidr", "10.0.0.0/16");
        net.normalize();
        assert_eq!(net.property("cidr"), Some(&PropertyValue::Cidr(String::from("10.0.0.0/16"))));
    }

    #[test]
    fn test_tagged_values_serialize_as_maps() {
        let decl = ResourceDeclaration::new("net1", ResourceKind::Network)
            .cidr("cidr", "10.0.0.0/16")
            .integer("max_azs", 2);
        let json = serde_json::to_value(&decl).unwrap();

        assert_eq!(json["kind"], "NETWORK");
        assert_eq!(json["properties"]["cidr"]["cidr"], "10.0.0.0/16");
        assert_eq!(json["properties"]["max_azs"], 2);
    }

    #[test]
    fn test_references_iterates_in_property_order() {
        let rule = ResourceDeclaration::new("rule1", ResourceKind::AccessRule)
            .reference("target", "db1")
            .reference("source", "web1")
            .integer("port", 3306);
        let refs: Vec<_> = rule.references().collect();
        assert_eq!(refs, vec![("source", "web1"), ("target", "db1")]);
    }
}
