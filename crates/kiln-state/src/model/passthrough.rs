//! Source to destination path mappings.
//!
//! Used for objects (host to guest) and artifacts (guest to host). The
//! textual form of a single mapping is `SRC` or `SRC => DST`; a missing
//! destination defaults to the base name of the source.

use std::fmt;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

const ARROW: &str = "=>";

/// A single `source => destination` mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mapping {
    pub source: String,
    pub destination: String,
}

impl Mapping {
    /// Parse one mapping from its textual form.
    pub fn parse(s: &str) -> Mapping {
        match s.split_once(ARROW) {
            Some((src, dst)) => {
                let source = src.trim().to_string();
                let dst = dst.trim();
                let destination = if dst.is_empty() {
                    base_name(&source).to_string()
                } else {
                    dst.to_string()
                };
                Mapping {
                    source,
                    destination,
                }
            }
            None => {
                let source = s.trim().to_string();
                Mapping {
                    destination: base_name(&source).to_string(),
                    source,
                }
            }
        }
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.source, ARROW, self.destination)
    }
}

/// Final path element of `path`, ignoring trailing slashes.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.is_empty() { "" } else { "/" };
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Ordered set of distinct mappings. One source may map to several
/// destinations; repeating an identical mapping is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Passthrough {
    mappings: Vec<Mapping>,
}

impl Passthrough {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every element of `items`, skipping blank ones.
    pub fn parse<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pt = Passthrough::new();
        for item in items {
            let item = item.as_ref();
            if item.trim().is_empty() {
                continue;
            }
            let m = Mapping::parse(item);
            pt.insert(m.source, m.destination);
        }
        pt
    }

    pub fn insert(&mut self, source: impl Into<String>, destination: impl Into<String>) {
        let mapping = Mapping {
            source: source.into(),
            destination: destination.into(),
        };
        if !self.mappings.contains(&mapping) {
            self.mappings.push(mapping);
        }
    }

    /// First destination mapped for `source`.
    pub fn get(&self, source: &str) -> Option<&str> {
        self.mappings
            .iter()
            .find(|m| m.source == source)
            .map(|m| m.destination.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.iter()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Textual form of every mapping, in insertion order.
    pub fn to_strings(&self) -> Vec<String> {
        self.mappings.iter().map(Mapping::to_string).collect()
    }
}

impl<'a> IntoIterator for &'a Passthrough {
    type Item = &'a Mapping;
    type IntoIter = std::slice::Iter<'a, Mapping>;

    fn into_iter(self) -> Self::IntoIter {
        self.mappings.iter()
    }
}

impl Serialize for Passthrough {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.mappings.len()))?;
        for m in &self.mappings {
            seq.serialize_element(&m.to_string())?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Passthrough {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PassthroughVisitor;

        impl<'de> Visitor<'de> for PassthroughVisitor {
            type Value = Passthrough;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a list of \"SRC\" or \"SRC => DST\" strings")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Passthrough, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element::<String>()? {
                    items.push(item);
                }
                Ok(Passthrough::parse(items))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Passthrough, E> {
                Ok(Passthrough::new())
            }
        }

        deserializer.deserialize_any(PassthroughVisitor)
    }
}
