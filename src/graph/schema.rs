//! Per-kind property schemas.

use super::declaration::ResourceKind;

/// Default allowed sizes for INSTANCE resources.
pub const INSTANCE_SIZES: &[&str] = &[
    "t2.micro",
    "t2.small",
    "t2.medium",
    "t2.large",
    "t3.micro",
    "t3.small",
    "t3.medium",
    "t3.large",
    "m5.large",
    "m5.xlarge",
];

/// Default allowed sizes for DATABASE resources.
pub const DATABASE_SIZES: &[&str] = &[
    "db.t2.micro",
    "db.t2.small",
    "db.t3.micro",
    "db.t3.small",
    "db.t3.medium",
    "db.m5.large",
];

/// Expected type of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Any string.
    Text,
    /// Integer within an inclusive range.
    Integer {
        /// Smallest allowed value.
        min: i64,
        /// Largest allowed value.
        max: i64,
    },
    /// Integer port in `[1, 65535]`.
    Port,
    /// IPv4 or IPv6 network range.
    Cidr,
    /// One of a fixed set of strings.
    Choice(&'static [&'static str]),
    /// A size name checked against the validator's size list for the kind.
    Size,
    /// Reference to a resource of one of the listed kinds.
    Reference(&'static [ResourceKind]),
}

/// Schema entry for a single property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySpec {
    /// Property name.
    pub name: &'static str,
    /// Expected value type.
    pub value_type: ValueType,
    /// Whether the property must be present.
    pub required: bool,
    /// Whether the property can only be set at creation.
    pub immutable: bool,
}

/// Property schema of a resource kind.
#[derive(Debug)]
pub struct KindSchema {
    /// The kind this schema describes.
    pub kind: ResourceKind,
    /// Known properties.
    pub properties: &'static [PropertySpec],
}

impl PropertySpec {
    const fn optional(name: &'static str, value_type: ValueType) -> Self {
        Self {
            name,
            value_type,
            required: false,
            immutable: false,
        }
    }

    const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    const fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }
}

const NETWORK_KIND: &[ResourceKind] = &[ResourceKind::Network];
const ENDPOINT_KINDS: &[ResourceKind] = &[ResourceKind::Instance, ResourceKind::Database];

static NETWORK: KindSchema = KindSchema {
    kind: ResourceKind::Network,
    properties: &[
        PropertySpec::optional("cidr", ValueType::Cidr).required().immutable(),
        PropertySpec::optional("max_azs", ValueType::Integer { min: 1, max: 16 }),
    ],
};

static INSTANCE: KindSchema = KindSchema {
    kind: ResourceKind::Instance,
    properties: &[
        PropertySpec::optional("network", ValueType::Reference(NETWORK_KIND))
            .required()
            .immutable(),
        PropertySpec::optional("size", ValueType::Size),
        PropertySpec::optional("image", ValueType::Text),
        PropertySpec::optional("subnet", ValueType::Choice(&["PUBLIC", "PRIVATE", "ISOLATED"]))
            .immutable(),
        PropertySpec::optional("user_data", ValueType::Text),
        PropertySpec::optional("public_port", ValueType::Port),
    ],
};

static DATABASE: KindSchema = KindSchema {
    kind: ResourceKind::Database,
    properties: &[
        PropertySpec::optional("network", ValueType::Reference(NETWORK_KIND))
            .required()
            .immutable(),
        PropertySpec::optional("size", ValueType::Size),
        PropertySpec::optional("engine", ValueType::Choice(&["mysql", "postgres"])).immutable(),
        PropertySpec::optional("engine_version", ValueType::Text),
        PropertySpec::optional("database_name", ValueType::Text).immutable(),
        PropertySpec::optional("port", ValueType::Port),
    ],
};

static ACCESS_RULE: KindSchema = KindSchema {
    kind: ResourceKind::AccessRule,
    properties: &[
        PropertySpec::optional("source", ValueType::Reference(ENDPOINT_KINDS)).required(),
        PropertySpec::optional("target", ValueType::Reference(ENDPOINT_KINDS)).required(),
        PropertySpec::optional("port", ValueType::Port).required(),
        PropertySpec::optional("protocol", ValueType::Choice(&["tcp", "udp"])),
    ],
};

impl KindSchema {
    /// Returns the schema for a kind.
    #[must_use]
    pub fn for_kind(kind: ResourceKind) -> &'static Self {
        match kind {
            ResourceKind::Network => &NETWORK,
            ResourceKind::Instance => &INSTANCE,
            ResourceKind::Database => &DATABASE,
            ResourceKind::AccessRule => &ACCESS_RULE,
        }
    }

    /// Looks up a property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&'static PropertySpec> {
        self.properties.iter().find(|spec| spec.name == name)
    }

    /// Iterates over the required properties.
    pub fn required(&self) -> impl Iterator<Item = &'static PropertySpec> {
        self.properties.iter().filter(|spec| spec.required)
    }

    /// Returns true if the named property cannot change in place.
    ///
    /// Unknown properties are treated as mutable.
    #[must_use]
    pub fn is_immutable(&self, name: &str) -> bool {
        self.property(name).is_some_and(|spec| spec.immutable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_a_schema() {
        for kind in ResourceKind::ALL {
            assert_eq!(KindSchema::for_kind(kind).kind, kind);
        }
    }

    #[test]
    fn test_immutable_flags() {
        let network = KindSchema::for_kind(ResourceKind::Network);
        assert!(network.is_immutable("cidr"));
        assert!(!network.is_immutable("max_azs"));
        assert!(!network.is_immutable("nonexistent"));

        let database = KindSchema::for_kind(ResourceKind::Database);
        assert!(database.is_immutable("engine"));
        assert!(!database.is_immutable("size"));
    }

    #[test]
    fn test_required_properties() {
        let rule = KindSchema::for_kind(ResourceKind::AccessRule);
        let names: Vec<_> = rule.required().map(|spec| spec.name).collect();
        assert_eq!(names, vec!["source", "target", "port"]);
    }
}
