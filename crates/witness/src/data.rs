use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::obfuscate::FormatKind;

/// Data is a typed shape observed at one location of an HTTP transaction:
/// a primitive leaf, a string-keyed struct, an ordered list, a set of
/// conflicting observations, or an observed absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Data {
    Primitive(Primitive),
    Struct { fields: BTreeMap<String, Data> },
    List { elems: Vec<Data> },
    /// Multiple shapes were seen for the same location. `conflict` is set
    /// when the variants disagree on type rather than just on value.
    OneOf {
        variants: BTreeMap<TreeHash, Data>,
        conflict: bool,
    },
    None,
}

impl Data {
    pub fn string(s: impl Into<String>) -> Data {
        Data::Primitive(Primitive::plain(Value::String(s.into())))
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Data {
        Data::Primitive(Primitive::plain(Value::Bytes(b.into())))
    }

    pub fn bool(b: bool) -> Data {
        Data::Primitive(Primitive::plain(Value::Bool(b)))
    }

    pub fn int(n: i64) -> Data {
        Data::Primitive(Primitive::plain(Value::Int(n)))
    }

    pub fn uint(n: u64) -> Data {
        Data::Primitive(Primitive::plain(Value::Uint(n)))
    }

    pub fn float(n: f64) -> Data {
        Data::Primitive(Primitive::plain(Value::Float(n)))
    }

    /// Walk the tree depth-first, visiting every primitive leaf.
    pub fn visit_primitives<'a>(&'a self, visit: &mut impl FnMut(&'a Primitive)) {
        match self {
            Data::Primitive(p) => visit(p),
            Data::Struct { fields } => {
                for child in fields.values() {
                    child.visit_primitives(visit);
                }
            }
            Data::List { elems } => {
                for child in elems {
                    child.visit_primitives(visit);
                }
            }
            Data::OneOf { variants, .. } => {
                for child in variants.values() {
                    child.visit_primitives(visit);
                }
            }
            Data::None => {}
        }
    }
}

/// A typed leaf value, together with the format category recognized for it
/// before obfuscation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Primitive {
    pub value: Value,
    #[serde(default, skip_serializing_if = "FormatKind::is_plain")]
    pub format: FormatKind,
}

impl Primitive {
    pub fn plain(value: Value) -> Primitive {
        Primitive {
            value,
            format: FormatKind::Plain,
        }
    }
}

/// The primitive value arms mirror the distinctions we must preserve on the
/// wire: signed and unsigned 64-bit integers are separate types because a
/// value above i64::MAX must not be silently narrowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

/// Stable digest of a data subtree in hexadecimal form. Used as the map key
/// of witness args/responses so that structurally identical observations
/// collapse to one entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeHash(String);

impl TreeHash {
    pub fn from_digest(digest: u64) -> TreeHash {
        TreeHash(format!("{:016x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TreeHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn visit_reaches_every_leaf() {
        let mut fields = BTreeMap::new();
        fields.insert("a".to_string(), Data::int(1));
        fields.insert(
            "b".to_string(),
            Data::List {
                elems: vec![Data::string("x"), Data::bool(true)],
            },
        );
        let tree = Data::Struct { fields };

        let mut seen = 0;
        tree.visit_primitives(&mut |_| seen += 1);
        assert_eq!(3, seen);
    }
}
