//! Partial-witness assembly from HTTP records.
//!
//! Each record becomes a half-populated witness: args for a request,
//! responses for a response. Every primitive leaf is obfuscated before the
//! witness leaves this module; pairing and upload never see raw values.

use std::collections::BTreeSet;

use records::{HttpRequest, HttpResponse, PairKey};
use witness::{
    obfuscate_tree, AuthScheme, Data, Location, Meta, Method, Primitive, Witness,
};

use crate::infer::{bytes_sample, infer_body, interpret, BodyEntry};
use crate::{body, BodyError};

// Vendor-specific auth headers recognized in addition to Authorization.
const PROPRIETARY_AUTH_HEADERS: &[&str] = &["x-hub-signature", "x-hub-signature-256"];

// Headers consumed by dedicated paths and excluded from generic header data.
const CONSUMED_HEADERS: &[&str] = &[
    "content-type",
    "cookie",
    "set-cookie",
    "x-forwarded-for",
    "authorization",
    "host",
];

/// A half witness plus the identifiers the pair cache needs.
#[derive(Debug, Clone)]
pub struct Built {
    pub witness: Witness,
    pub pair_key: PairKey,
    /// Load-balancer source hint, carried alongside rather than as data.
    pub x_forwarded_for: Option<String>,
}

pub fn build_request(req: &HttpRequest) -> Result<Built, witness::Error> {
    let mut witness = Witness::new(Method {
        verb: req.method.clone(),
        path: req.path.clone(),
        host: req.host.clone(),
    });

    // Query keys are recorded once; the first value wins.
    if let Some(query) = &req.query {
        let mut seen = BTreeSet::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if !seen.insert(key.clone().into_owned()) {
                continue;
            }
            let data = obfuscated(Data::Primitive(Primitive::plain(interpret(&value))));
            witness.insert_arg(
                Meta::request(Location::Query {
                    key: key.into_owned(),
                }),
                data,
            )?;
        }
    }

    for (location, data) in header_entries(&req.headers, true) {
        witness.insert_arg(Meta::request(location), data)?;
    }

    for (name, value) in &req.cookies {
        witness.insert_arg(
            Meta::request(Location::Cookie { key: name.clone() }),
            obfuscated(Data::string(value.clone())),
        )?;
    }

    for entry in decode_and_infer(&req.headers, &req.body, req.body_decompressed) {
        witness.insert_arg(Meta::request(entry.location), obfuscated(entry.data))?;
    }

    Ok(Built {
        witness,
        pair_key: req.pair_key(),
        x_forwarded_for: req.headers.get("x-forwarded-for").map(str::to_string),
    })
}

pub fn build_response(resp: &HttpResponse) -> Result<Built, witness::Error> {
    // Method metadata is unknown on the response side; pairing merges the
    // request's in.
    let mut witness = Witness::new(Method::unknown());
    let status = resp.status;

    for (location, data) in header_entries(&resp.headers, false) {
        witness.insert_response(Meta::response(location, status), data)?;
    }

    for (name, value) in &resp.cookies {
        witness.insert_response(
            Meta::response(Location::Cookie { key: name.clone() }, status),
            obfuscated(Data::string(value.clone())),
        )?;
    }

    for entry in decode_and_infer(&resp.headers, &resp.body, resp.body_decompressed) {
        witness.insert_response(Meta::response(entry.location, status), obfuscated(entry.data))?;
    }

    Ok(Built {
        witness,
        pair_key: resp.pair_key(),
        x_forwarded_for: None,
    })
}

fn obfuscated(mut data: Data) -> Data {
    obfuscate_tree(&mut data);
    data
}

/// Generic headers become one entry each, first value per name. Auth-bearing
/// headers become auth nodes instead; consumed headers are skipped entirely.
fn header_entries(headers: &records::Headers, request_side: bool) -> Vec<(Location, Data)> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for (name, value) in headers.iter() {
        let lowered = name.to_ascii_lowercase();
        if !seen.insert(lowered.clone()) {
            continue;
        }
        if request_side && lowered == "authorization" {
            out.push((
                Location::Auth {
                    scheme: AuthScheme::from_credential(value),
                },
                obfuscated(Data::string(value)),
            ));
            continue;
        }
        if request_side && PROPRIETARY_AUTH_HEADERS.contains(&lowered.as_str()) {
            out.push((
                Location::Auth {
                    scheme: AuthScheme::Proprietary,
                },
                obfuscated(Data::string(value)),
            ));
            continue;
        }
        if CONSUMED_HEADERS.contains(&lowered.as_str()) {
            continue;
        }
        out.push((
            Location::Header {
                key: name.to_string(),
            },
            obfuscated(Data::Primitive(Primitive::plain(interpret(value)))),
        ));
    }
    out
}

/// Undo the Content-Encoding chain and dispatch the body by content type.
/// A declared-encoding failure drops the body (the record survives); an
/// undeclared decode failure gets one bounded trial decompression before
/// degrading to an opaque sample.
fn decode_and_infer(
    headers: &records::Headers,
    raw: &[u8],
    already_decompressed: bool,
) -> Vec<BodyEntry> {
    if raw.is_empty() {
        return Vec::new();
    }
    let content_type = headers.get("content-type");
    let declared_encoding = headers
        .get("content-encoding")
        .filter(|_| !already_decompressed);

    let decoded = match declared_encoding {
        Some(encoding) => {
            match body::parse_encoding_chain(encoding).and_then(|chain| body::decode_body(raw, &chain)) {
                Ok(decoded) => decoded,
                Err(err) => {
                    tracing::warn!(encoding, error = %err, "failed to decode body content encoding; dropping body");
                    return Vec::new();
                }
            }
        }
        None => raw.to_vec(),
    };

    match infer_body(content_type, &decoded) {
        Ok(entries) => entries,
        Err(err @ (BodyError::Json(_) | BodyError::Yaml(_))) => {
            if declared_encoding.is_none() {
                if let Some(inflated) = body::trial_decompress(&decoded) {
                    if let Ok(entries) = infer_body(content_type, &inflated) {
                        return entries;
                    }
                }
            }
            tracing::debug!(error = %err, "body failed structured decoding; sampling as bytes");
            vec![bytes_sample(content_type.unwrap_or("application/octet-stream"), &decoded)]
        }
        Err(BodyError::UnknownCharset(label)) => {
            tracing::warn!(charset = %label, "unknown charset; dropping body");
            Vec::new()
        }
        Err(err) => {
            tracing::debug!(error = %err, "unparsable body; sampling as bytes");
            vec![bytes_sample(content_type.unwrap_or("application/octet-stream"), &decoded)]
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use records::{Endpoints, Headers, Observed, StreamId};
    use std::net::{IpAddr, Ipv4Addr};
    use witness::Value;

    fn endpoints() -> Endpoints {
        Endpoints {
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            src_port: 40000,
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dst_port: 80,
        }
    }

    fn request() -> HttpRequest {
        HttpRequest {
            stream: StreamId(5),
            seq: 0,
            endpoints: endpoints(),
            observed: Observed::at(Utc::now()),
            method: "POST".to_string(),
            path: "/v1/users".to_string(),
            query: Some("limit=10&limit=20&verbose=true".to_string()),
            host: "api.example.com".to_string(),
            headers: Headers(vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Authorization".to_string(), "Bearer secret.token.here".to_string()),
                ("X-Request-Source".to_string(), "mobile".to_string()),
                ("X-Forwarded-For".to_string(), "203.0.113.9".to_string()),
            ]),
            cookies: vec![("sid".to_string(), "opaque-session-value".to_string())],
            body: br#"{"name": "Ada", "age": 36}"#.to_vec(),
            body_decompressed: false,
        }
    }

    #[test]
    fn request_witness_covers_query_headers_cookies_body() {
        let built = build_request(&request()).unwrap();
        let w = &built.witness;
        assert_eq!("POST", w.method.verb);
        assert_eq!("/v1/users", w.method.path);
        assert_eq!("api.example.com", w.method.host);
        assert!(w.has_request() && !w.has_response());
        assert_eq!(Some("203.0.113.9".to_string()), built.x_forwarded_for);

        let mut query_keys = Vec::new();
        let mut auth = 0;
        let mut cookies = 0;
        let mut headers = Vec::new();
        let mut bodies = 0;
        for entry in w.args.values() {
            match &entry.meta.location {
                Location::Query { key } => query_keys.push(key.clone()),
                Location::Auth { scheme } => {
                    auth += 1;
                    assert_eq!(AuthScheme::Bearer, *scheme);
                }
                Location::Cookie { .. } => cookies += 1,
                Location::Header { key } => headers.push(key.clone()),
                Location::Body { content_type } => {
                    bodies += 1;
                    assert_eq!("application/json", content_type);
                }
                other => panic!("unexpected location: {:?}", other),
            }
        }
        query_keys.sort();
        // `limit` recorded once (first value wins), `verbose` once.
        assert_eq!(vec!["limit".to_string(), "verbose".to_string()], query_keys);
        assert_eq!(1, auth);
        assert_eq!(1, cookies);
        // Consumed headers are excluded; only X-Request-Source survives.
        assert_eq!(vec!["X-Request-Source".to_string()], headers);
        assert_eq!(1, bodies);
    }

    #[test]
    fn no_raw_value_survives_obfuscation() {
        let built = build_request(&request()).unwrap();
        for entry in built.witness.args.values() {
            entry.data.visit_primitives(&mut |p| {
                if let Value::String(s) = &p.value {
                    for secret in ["secret.token.here", "opaque-session-value", "mobile", "Ada"] {
                        assert!(!s.contains(secret), "raw value leaked: {}", s);
                    }
                }
            });
        }
    }

    #[test]
    fn response_witness_is_response_only_with_status() {
        let resp = HttpResponse {
            stream: StreamId(5),
            seq: 0,
            endpoints: endpoints().flipped(),
            observed: Observed::at(Utc::now()),
            status: 201,
            headers: Headers(vec![(
                "Content-Type".to_string(),
                "application/json".to_string(),
            )]),
            cookies: vec![],
            body: br#"{"id": 99}"#.to_vec(),
            body_decompressed: false,
        };
        let built = build_response(&resp).unwrap();
        assert!(built.witness.method.is_unknown());
        assert!(built.witness.has_response() && !built.witness.has_request());
        for entry in built.witness.responses.values() {
            assert_eq!(Some(201), entry.meta.status);
        }
        // Same stream and seq pair with the request side.
        assert_eq!(build_request(&request()).unwrap().pair_key, built.pair_key);
    }

    #[test]
    fn gzip_body_is_decompressed_before_inference() {
        use std::io::Write;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(br#"{"n": 1}"#).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut req = request();
        req.headers.push("Content-Encoding", "gzip");
        req.body = compressed;
        let built = build_request(&req).unwrap();
        let body_entries: Vec<_> = built
            .witness
            .args
            .values()
            .filter(|e| matches!(e.meta.location, Location::Body { .. }))
            .collect();
        assert_eq!(1, body_entries.len());
        assert!(matches!(body_entries[0].data, Data::Struct { .. }));
    }

    #[test]
    fn undeclared_gzip_json_recovers_via_trial_decompression() {
        use std::io::Write;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(br#"{"n": 1}"#).unwrap();

        let mut req = request();
        req.body = encoder.finish().unwrap();
        let built = build_request(&req).unwrap();
        let body_entry = built
            .witness
            .args
            .values()
            .find(|e| matches!(e.meta.location, Location::Body { .. }))
            .expect("body entry");
        assert!(matches!(body_entry.data, Data::Struct { .. }));
    }
}
