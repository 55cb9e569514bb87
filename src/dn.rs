// Distinguished names and their reversed storage form
//
// A DN is stored leaf first ("cn=alice,ou=users,dc=teapot,dc=ovh"); its Prefix
// is the same components root first ("dc=ovh/dc=teapot/ou=users/cn=alice").
// Sorting prefixes lexicographically puts every entry right after its ancestors,
// which is what the stores rely on for subtree scans.

use anyhow::{bail, Result};
use std::fmt;

const DN_SEPARATOR: char = ',';
const PREFIX_SEPARATOR: char = '/';

/// One `type=value` pair, lowercased and trimmed on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Component {
    pub typ: String,
    pub value: String,
}

impl Component {
    pub fn new(typ: &str, value: &str) -> Self {
        Self {
            typ: typ.trim().to_lowercase(),
            value: value.trim().to_lowercase(),
        }
    }

    /// Separator characters are refused so a DN and its Prefix always parse back.
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(c) = raw.chars().find(|c| *c == DN_SEPARATOR || *c == PREFIX_SEPARATOR) {
            bail!("invalid DN component {:?}: '{}' is not allowed", raw, c);
        }
        let parts: Vec<&str> = raw.split('=').collect();
        if parts.len() != 2 {
            bail!("invalid DN component {:?}: expected exactly one '='", raw);
        }
        let component = Self::new(parts[0], parts[1]);
        if component.typ.is_empty() {
            bail!("invalid DN component {:?}: empty attribute type", raw);
        }
        Ok(component)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.typ, self.value)
    }
}

fn parse_components(raw: &str, separator: char) -> Result<Vec<Component>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(separator).map(Component::parse).collect()
}

fn join_components<'a>(
    f: &mut fmt::Formatter<'_>,
    components: impl Iterator<Item = &'a Component>,
    separator: char,
) -> fmt::Result {
    for (i, component) in components.enumerate() {
        if i > 0 {
            write!(f, "{}", separator)?;
        }
        write!(f, "{}", component)?;
    }
    Ok(())
}

/// Distinguished name, leaf first. The empty DN is the root of the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dn(Vec<Component>);

impl Dn {
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(Self(parse_components(raw, DN_SEPARATOR)?))
    }

    pub fn from_components(components: Vec<Component>) -> Self {
        Self(components)
    }

    pub fn components(&self) -> &[Component] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of components.
    pub fn level(&self) -> usize {
        self.0.len()
    }

    /// The leaf component, None for the empty DN.
    pub fn leaf(&self) -> Option<&Component> {
        self.0.first()
    }

    /// The DN with its leaf removed; the empty DN is its own parent.
    pub fn parent(&self) -> Dn {
        Dn(self.0.iter().skip(1).cloned().collect())
    }

    pub fn prefix(&self) -> Prefix {
        Prefix(self.0.iter().rev().cloned().collect())
    }

    /// True when `self` equals `other` or lies below it.
    pub fn is_descendant_of(&self, other: &Dn) -> bool {
        other.prefix().is_prefix_of(&self.prefix())
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        join_components(f, self.0.iter(), DN_SEPARATOR)
    }
}

/// A DN in reverse (root first) order, joined by '/'. This is the storage key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Prefix(Vec<Component>);

impl Prefix {
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(Self(parse_components(raw, PREFIX_SEPARATOR)?))
    }

    pub fn components(&self) -> &[Component] {
        &self.0
    }

    pub fn level(&self) -> usize {
        self.0.len()
    }

    pub fn to_dn(&self) -> Dn {
        Dn(self.0.iter().rev().cloned().collect())
    }

    /// Component-wise prefix test: "dc=ovh/dc=teapot" is a prefix of
    /// "dc=ovh/dc=teapot/ou=users" but not of "dc=ovh/dc=teapots".
    pub fn is_prefix_of(&self, other: &Prefix) -> bool {
        other.0.len() >= self.0.len() && self.0[..] == other.0[..self.0.len()]
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        join_components(f, self.0.iter(), PREFIX_SEPARATOR)
    }
}
