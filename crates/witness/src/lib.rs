//! The witness data model: a typed, obfuscated record of one HTTP
//! transaction (or half of one, while it awaits pairing).
//!
//! A witness is a tree whose root carries HTTP method metadata and two maps,
//! `args` (request-side observations) and `responses` (response-side
//! observations), keyed by a stable hash of each entry so that structurally
//! identical observations collapse.

use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry as MapEntry;
use std::collections::BTreeMap;

mod data;
pub mod hash;
mod meta;
pub mod obfuscate;

pub use data::{Data, Primitive, TreeHash, Value};
pub use meta::{AuthScheme, Location, Meta};
pub use obfuscate::{categorize, obfuscate_tree, FormatKind};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("hash collision on distinct subtrees under key {0}")]
    HashCollision(TreeHash),
}

/// HTTP method metadata at the root of a witness. `path` is the raw path as
/// captured; templating happens server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Method {
    pub verb: String,
    pub path: String,
    pub host: String,
}

impl Method {
    /// Sentinel for a response-side partial whose request has not been seen.
    /// Replaced during pairing.
    pub fn unknown() -> Method {
        Method {
            verb: String::new(),
            path: String::new(),
            host: String::new(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.verb.is_empty() && self.path.is_empty()
    }
}

/// One observation: location metadata plus the data shape seen there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub meta: Meta,
    pub data: Data,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Witness {
    pub method: Method,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<TreeHash, Entry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub responses: BTreeMap<TreeHash, Entry>,
}

impl Witness {
    pub fn new(method: Method) -> Witness {
        Witness {
            method,
            args: BTreeMap::new(),
            responses: BTreeMap::new(),
        }
    }

    /// A witness with a non-empty args map represents at least a request.
    pub fn has_request(&self) -> bool {
        !self.args.is_empty()
    }

    /// A witness with a non-empty responses map represents at least a response.
    pub fn has_response(&self) -> bool {
        !self.responses.is_empty()
    }

    pub fn is_paired(&self) -> bool {
        self.has_request() && self.has_response()
    }

    pub fn insert_arg(&mut self, meta: Meta, data: Data) -> Result<(), Error> {
        Self::insert(&mut self.args, meta, data)
    }

    pub fn insert_response(&mut self, meta: Meta, data: Data) -> Result<(), Error> {
        Self::insert(&mut self.responses, meta, data)
    }

    fn insert(
        map: &mut BTreeMap<TreeHash, Entry>,
        meta: Meta,
        data: Data,
    ) -> Result<(), Error> {
        let key = TreeHash::from_digest(hash::entry_digest(&meta, &data));
        match map.entry(key.clone()) {
            MapEntry::Vacant(slot) => {
                slot.insert(Entry { meta, data });
                Ok(())
            }
            // Same digest, same content: the observation is already present.
            MapEntry::Occupied(existing)
                if existing.get().meta == meta && existing.get().data == data =>
            {
                Ok(())
            }
            MapEntry::Occupied(_) => Err(Error::HashCollision(key)),
        }
    }

    /// Merge the other half of a transaction into this witness. Request-side
    /// method metadata wins over the response-side sentinel.
    pub fn merge(&mut self, other: Witness) -> Result<(), Error> {
        if self.method.is_unknown() && !other.method.is_unknown() {
            self.method = other.method;
        }
        for (_, entry) in other.args {
            Self::insert(&mut self.args, entry.meta, entry.data)?;
        }
        for (_, entry) in other.responses {
            Self::insert(&mut self.responses, entry.meta, entry.data)?;
        }
        Ok(())
    }

    /// Canonical digest of the whole tree, stable between implementations.
    pub fn canonical_hash(&self) -> TreeHash {
        TreeHash::from_digest(hash::witness_digest(self))
    }

    /// Canonical serialization, base64-url encoded for the upload row.
    pub fn encode(&self) -> String {
        // BTreeMap keys serialize in sorted order, which is the canonical form.
        let json = serde_json::to_vec(self).expect("witness serialization is infallible");
        base64::encode_config(json, base64::URL_SAFE_NO_PAD)
    }
}
