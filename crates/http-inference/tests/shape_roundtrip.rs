//! A JSON body of a known shape decodes to a data tree whose flattened
//! (path, type) set equals that of the input, with leaf values obfuscated.

use std::collections::BTreeSet;

use chrono::Utc;
use serde_json::json;

use http_inference::build_request;
use records::{Endpoints, Headers, HttpRequest, Observed, StreamId};
use witness::{Data, Location, Value};

fn request_with_json(body: serde_json::Value) -> HttpRequest {
    HttpRequest {
        stream: StreamId(11),
        seq: 0,
        endpoints: Endpoints {
            src_ip: "10.0.0.1".parse().unwrap(),
            src_port: 40000,
            dst_ip: "10.0.0.2".parse().unwrap(),
            dst_port: 443,
        },
        observed: Observed::at(Utc::now()),
        method: "POST".to_string(),
        path: "/v1/orders".to_string(),
        query: None,
        host: "api.example.com".to_string(),
        headers: Headers(vec![(
            "Content-Type".to_string(),
            "application/json".to_string(),
        )]),
        cookies: vec![],
        body: serde_json::to_vec(&body).unwrap(),
        body_decompressed: false,
    }
}

/// Flatten a JSON value into (path, type-tag) pairs.
fn flatten_json(value: &serde_json::Value, path: &str, out: &mut BTreeSet<(String, String)>) {
    match value {
        serde_json::Value::Null => {
            out.insert((path.to_string(), "none".to_string()));
        }
        serde_json::Value::Bool(_) => {
            out.insert((path.to_string(), "bool".to_string()));
        }
        serde_json::Value::Number(n) => {
            let tag = if n.as_i64().is_some() {
                "int"
            } else if n.as_u64().is_some() {
                "uint"
            } else {
                "float"
            };
            out.insert((path.to_string(), tag.to_string()));
        }
        serde_json::Value::String(_) => {
            out.insert((path.to_string(), "string".to_string()));
        }
        serde_json::Value::Array(elems) => {
            for (i, elem) in elems.iter().enumerate() {
                flatten_json(elem, &format!("{}/{}", path, i), out);
            }
        }
        serde_json::Value::Object(fields) => {
            for (k, v) in fields {
                flatten_json(v, &format!("{}/{}", path, k), out);
            }
        }
    }
}

/// Flatten a witness data tree the same way.
fn flatten_data(data: &Data, path: &str, out: &mut BTreeSet<(String, String)>) {
    match data {
        Data::None => {
            out.insert((path.to_string(), "none".to_string()));
        }
        Data::Primitive(p) => {
            let tag = match &p.value {
                Value::Bool(_) => "bool",
                Value::Int(_) => "int",
                Value::Uint(_) => "uint",
                Value::Float(_) => "float",
                Value::String(_) => "string",
                Value::Bytes(_) => "bytes",
            };
            out.insert((path.to_string(), tag.to_string()));
        }
        Data::List { elems } => {
            for (i, elem) in elems.iter().enumerate() {
                flatten_data(elem, &format!("{}/{}", path, i), out);
            }
        }
        Data::Struct { fields } => {
            for (k, v) in fields {
                flatten_data(v, &format!("{}/{}", path, k), out);
            }
        }
        Data::OneOf { variants, .. } => {
            for v in variants.values() {
                flatten_data(v, path, out);
            }
        }
    }
}

#[test]
fn json_body_shape_survives_inference_and_obfuscation() {
    let body = json!({
        "order": {
            "id": 123456789,
            "total": 42.5,
            "paid": true,
            "note": null,
            "items": [
                {"sku": "A-100", "qty": 2},
                {"sku": "B-200", "qty": 1},
            ],
        },
        "customer": "Grace Hopper",
        "big": 14201265876841261000u64,
    });

    let built = build_request(&request_with_json(body.clone())).unwrap();
    let body_entry = built
        .witness
        .args
        .values()
        .find(|e| matches!(e.meta.location, Location::Body { .. }))
        .expect("a body entry");

    let mut want = BTreeSet::new();
    flatten_json(&body, "", &mut want);
    let mut got = BTreeSet::new();
    flatten_data(&body_entry.data, "", &mut got);
    assert_eq!(want, got);

    // And the leaves themselves were obfuscated.
    body_entry.data.visit_primitives(&mut |p| {
        if let Value::String(s) = &p.value {
            assert!(!s.contains("Grace") && !s.contains("A-100") && !s.contains("B-200"));
        }
    });
}
