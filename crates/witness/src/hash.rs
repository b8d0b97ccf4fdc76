//! Canonical hashing of witness trees.
//!
//! The digest is a depth-first walk writing a tag byte per variant,
//! little-endian scalars, and length-prefixed strings into an xxh3 stream.
//! Struct fields are visited in key order (the maps are BTreeMaps), so two
//! structurally equal subtrees always digest identically, independent of
//! construction order.

use xxhash_rust::xxh3::Xxh3;

use crate::data::{Data, Primitive, Value};
use crate::meta::{Location, Meta};
use crate::{Method, Witness};

// Variant tags. These are part of the wire contract: changing one changes
// every witness hash.
const TAG_NONE: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_BYTES: u8 = 6;
const TAG_STRUCT: u8 = 7;
const TAG_LIST: u8 = 8;
const TAG_ONEOF: u8 = 9;

const TAG_QUERY: u8 = 16;
const TAG_HEADER: u8 = 17;
const TAG_COOKIE: u8 = 18;
const TAG_BODY: u8 = 19;
const TAG_MULTIPART: u8 = 20;
const TAG_AUTH: u8 = 21;
const TAG_STATUS: u8 = 22;
const TAG_METHOD: u8 = 23;

/// Digest of one (meta, data) entry. This is the key under which the entry
/// lands in a witness args/responses map.
pub fn entry_digest(meta: &Meta, data: &Data) -> u64 {
    let mut h = Xxh3::new();
    write_meta(&mut h, meta);
    write_data(&mut h, data);
    h.digest()
}

/// Digest of a complete witness, stable across implementations that agree
/// on the tag table above.
pub fn witness_digest(witness: &Witness) -> u64 {
    let mut h = Xxh3::new();
    write_method(&mut h, &witness.method);
    for (key, entry) in &witness.args {
        write_str(&mut h, key.as_str());
        write_meta(&mut h, &entry.meta);
        write_data(&mut h, &entry.data);
    }
    for (key, entry) in &witness.responses {
        write_str(&mut h, key.as_str());
        write_meta(&mut h, &entry.meta);
        write_data(&mut h, &entry.data);
    }
    h.digest()
}

fn write_method(h: &mut Xxh3, method: &Method) {
    h.update(&[TAG_METHOD]);
    write_str(h, &method.verb);
    write_str(h, &method.path);
    write_str(h, &method.host);
}

fn write_meta(h: &mut Xxh3, meta: &Meta) {
    match &meta.location {
        Location::Query { key } => {
            h.update(&[TAG_QUERY]);
            write_str(h, key);
        }
        Location::Header { key } => {
            h.update(&[TAG_HEADER]);
            write_str(h, key);
        }
        Location::Cookie { key } => {
            h.update(&[TAG_COOKIE]);
            write_str(h, key);
        }
        Location::Body { content_type } => {
            h.update(&[TAG_BODY]);
            write_str(h, content_type);
        }
        Location::Multipart { subtype } => {
            h.update(&[TAG_MULTIPART]);
            write_str(h, subtype);
        }
        Location::Auth { scheme } => {
            h.update(&[TAG_AUTH]);
            write_str(h, &format!("{:?}", scheme));
        }
    }
    if let Some(status) = meta.status {
        h.update(&[TAG_STATUS]);
        h.update(&status.to_le_bytes());
    }
}

fn write_data(h: &mut Xxh3, data: &Data) {
    match data {
        Data::Primitive(p) => write_primitive(h, p),
        Data::Struct { fields } => {
            h.update(&[TAG_STRUCT]);
            h.update(&(fields.len() as u64).to_le_bytes());
            for (key, child) in fields {
                write_str(h, key);
                write_data(h, child);
            }
        }
        Data::List { elems } => {
            h.update(&[TAG_LIST]);
            h.update(&(elems.len() as u64).to_le_bytes());
            for child in elems {
                write_data(h, child);
            }
        }
        Data::OneOf { variants, conflict } => {
            h.update(&[TAG_ONEOF, *conflict as u8]);
            h.update(&(variants.len() as u64).to_le_bytes());
            for (key, child) in variants {
                write_str(h, key.as_str());
                write_data(h, child);
            }
        }
        Data::None => h.update(&[TAG_NONE]),
    }
}

fn write_primitive(h: &mut Xxh3, p: &Primitive) {
    match &p.value {
        Value::Bool(b) => h.update(&[TAG_BOOL, *b as u8]),
        Value::Int(n) => {
            h.update(&[TAG_INT]);
            h.update(&n.to_le_bytes());
        }
        Value::Uint(n) => {
            h.update(&[TAG_UINT]);
            h.update(&n.to_le_bytes());
        }
        Value::Float(n) => {
            h.update(&[TAG_FLOAT]);
            h.update(&n.to_bits().to_le_bytes());
        }
        Value::String(s) => {
            h.update(&[TAG_STRING]);
            write_str(h, s);
        }
        Value::Bytes(b) => {
            h.update(&[TAG_BYTES]);
            h.update(&(b.len() as u64).to_le_bytes());
            h.update(b);
        }
    }
}

fn write_str(h: &mut Xxh3, s: &str) {
    h.update(&(s.len() as u64).to_le_bytes());
    h.update(s.as_bytes());
}
