//! Content-type dispatch: decoded body bytes in, typed data trees out.

use std::collections::BTreeMap;

use witness::{Data, Location, Primitive, Value};

use crate::body::transcode_utf8;
use crate::sanitize::sanitize_json;
use crate::BodyError;

// Opaque and textual bodies are sampled, never fully retained.
const BODY_SAMPLE: usize = 10 * 1024;

/// One inferred observation from a body: where it sits (plain body or
/// multipart part) and its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyEntry {
    pub location: Location,
    pub data: Data,
}

/// Interpret a textual scalar the way it would have been typed at the
/// producer: booleans and numbers are recognized, preferring int64, then
/// uint64 for values that only fit unsigned, then float64.
pub fn interpret(s: &str) -> Value {
    match s {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = s.parse::<i64>() {
        return Value::Int(n);
    }
    if let Ok(n) = s.parse::<u64>() {
        return Value::Uint(n);
    }
    if s.bytes().any(|b| b.is_ascii_digit()) {
        if let Ok(f) = s.parse::<f64>() {
            if f.is_finite() {
                return Value::Float(f);
            }
        }
    }
    Value::String(s.to_string())
}

fn interpreted(s: &str) -> Data {
    Data::Primitive(Primitive::plain(interpret(s)))
}

/// Dispatch a decoded (decompressed) body by media type.
///
/// Charset transcoding to UTF-8 happens before any textual or structured
/// decoder runs, per the Content-Type `charset` parameter. Structured
/// decoder failures surface as errors so the caller can attempt trial
/// decompression before degrading to an opaque byte sample.
pub fn infer_body(content_type: Option<&str>, body: &[u8]) -> Result<Vec<BodyEntry>, BodyError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let declared = content_type.unwrap_or("application/octet-stream");
    let mime: mime::Mime = match declared.parse() {
        Ok(mime) => mime,
        Err(_) => return Ok(vec![bytes_sample(declared, body)]),
    };
    let essence = mime.essence_str().to_ascii_lowercase();
    let charset = mime.get_param(mime::CHARSET).map(|c| c.as_str().to_string());
    let charset = charset.as_deref();

    let entry = |data| BodyEntry {
        location: Location::Body {
            content_type: essence.clone(),
        },
        data,
    };

    if essence == "application/json" || mime.suffix().map(|s| s.as_str()) == Some("json") {
        let text = transcode_utf8(body, charset)?;
        let clean = sanitize_json(text.as_bytes());
        let value: serde_json::Value = serde_json::from_slice(&clean)?;
        return Ok(vec![entry(json_to_data(&value))]);
    }

    if essence == "application/x-www-form-urlencoded" {
        let text = transcode_utf8(body, charset)?;
        return Ok(vec![entry(form_to_data(text.as_bytes()))]);
    }

    if is_yaml(&essence, &mime) {
        let text = transcode_utf8(body, charset)?;
        let value: serde_yaml::Value = serde_yaml::from_str(&text)?;
        return Ok(vec![entry(yaml_to_data(&value))]);
    }

    if essence == "multipart/form-data" || essence == "multipart/mixed" {
        // The boundary scan runs on raw bytes; each part is recursively
        // dispatched with its own Content-Type and charset.
        let boundary = mime
            .get_param(mime::BOUNDARY)
            .ok_or(BodyError::MissingBoundary)?;
        let subtype = mime.subtype().as_str().to_string();
        return multipart_entries(&subtype, boundary.as_str(), body);
    }

    if essence == "text/html" {
        // Sampled without interpretation; markup is never a typed scalar.
        let text = transcode_utf8(body, charset)?;
        return Ok(vec![entry(Data::string(truncate(&text)))]);
    }

    if essence == "text/plain" || essence == "text/csv" {
        let text = transcode_utf8(body, charset)?;
        return Ok(vec![entry(interpreted(&truncate(&text)))]);
    }

    Ok(vec![bytes_sample(&essence, body)])
}

fn is_yaml(essence: &str, mime: &mime::Mime) -> bool {
    matches!(
        essence,
        "application/yaml" | "application/x-yaml" | "text/yaml" | "text/x-yaml"
    ) || mime.suffix().map(|s| s.as_str()) == Some("yaml")
}

fn truncate(text: &str) -> String {
    if text.len() <= BODY_SAMPLE {
        return text.to_string();
    }
    let mut end = BODY_SAMPLE;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// The opaque fallback: the first bytes of the body, uninterpreted.
pub fn bytes_sample(content_type: &str, body: &[u8]) -> BodyEntry {
    BodyEntry {
        location: Location::Body {
            content_type: content_type.to_string(),
        },
        data: Data::bytes(&body[..body.len().min(BODY_SAMPLE)]),
    }
}

fn json_to_data(value: &serde_json::Value) -> Data {
    use serde_json::Value as Json;
    match value {
        Json::Null => Data::None,
        Json::Bool(b) => Data::bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Data::int(i)
            } else if let Some(u) = n.as_u64() {
                Data::uint(u)
            } else {
                Data::float(n.as_f64().unwrap_or(0.0))
            }
        }
        // JSON strings carry their type explicitly; no reinterpretation.
        Json::String(s) => Data::string(s.clone()),
        Json::Array(elems) => Data::List {
            elems: elems.iter().map(json_to_data).collect(),
        },
        Json::Object(fields) => Data::Struct {
            fields: fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_data(v)))
                .collect(),
        },
    }
}

fn yaml_to_data(value: &serde_yaml::Value) -> Data {
    use serde_yaml::Value as Yaml;
    match value {
        Yaml::Null => Data::None,
        Yaml::Bool(b) => Data::bool(*b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Data::int(i)
            } else if let Some(u) = n.as_u64() {
                Data::uint(u)
            } else {
                Data::float(n.as_f64().unwrap_or(0.0))
            }
        }
        Yaml::String(s) => interpreted(s),
        Yaml::Sequence(elems) => Data::List {
            elems: elems.iter().map(yaml_to_data).collect(),
        },
        Yaml::Mapping(fields) => Data::Struct {
            fields: fields
                .iter()
                .filter_map(|(k, v)| yaml_key(k).map(|key| (key, yaml_to_data(v))))
                .collect(),
        },
    }
}

fn yaml_key(key: &serde_yaml::Value) -> Option<String> {
    use serde_yaml::Value as Yaml;
    match key {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Bool(b) => Some(b.to_string()),
        Yaml::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// x-www-form-urlencoded: one field per key. Single-valued keys stay scalar,
/// multi-valued become a list; every value is interpreted.
fn form_to_data(body: &[u8]) -> Data {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(body) {
        grouped.entry(key.into_owned()).or_default().push(value.into_owned());
    }
    Data::Struct {
        fields: grouped
            .into_iter()
            .map(|(key, mut values)| {
                let data = if values.len() == 1 {
                    interpreted(&values.pop().expect("one value"))
                } else {
                    Data::List {
                        elems: values.iter().map(|v| interpreted(v)).collect(),
                    }
                };
                (key, data)
            })
            .collect(),
    }
}

/// Iterate multipart parts; each is recursively dispatched with its own
/// Content-Type (default text/plain) and becomes its own body entry.
fn multipart_entries(
    subtype: &str,
    boundary: &str,
    body: &[u8],
) -> Result<Vec<BodyEntry>, BodyError> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut entries = Vec::new();

    let mut sections = split_on(body, &delimiter);
    // Everything before the first delimiter is preamble.
    if !sections.is_empty() {
        sections.remove(0);
    }

    for (index, section) in sections.into_iter().enumerate() {
        // The terminator section begins with "--".
        if section.starts_with(b"--") {
            break;
        }
        let section = strip_crlf(section);
        let (headers, part_body) = match split_once_bytes(section, b"\r\n\r\n") {
            Some(split) => split,
            None => (&[][..], section),
        };
        let part_body = trim_trailing_crlf(part_body);

        let mut content_type = "text/plain".to_string();
        let mut name: Option<String> = None;
        for line in headers.split(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(line);
            let line = line.trim_end_matches('\r').trim();
            if let Some(value) = strip_header(line, "content-type") {
                content_type = value.to_string();
            } else if let Some(value) = strip_header(line, "content-disposition") {
                name = disposition_name(value);
            }
        }

        let inferred = infer_body(Some(&content_type), part_body)?;
        let data = collapse(inferred);
        let field = name.unwrap_or_else(|| index.to_string());
        entries.push(BodyEntry {
            location: Location::Multipart {
                subtype: subtype.to_string(),
            },
            data: Data::Struct {
                fields: BTreeMap::from([(field, data)]),
            },
        });
    }
    Ok(entries)
}

/// Merge the entries of a nested dispatch into a single data node.
fn collapse(mut entries: Vec<BodyEntry>) -> Data {
    match entries.len() {
        0 => Data::None,
        1 => entries.pop().expect("one entry").data,
        _ => Data::List {
            elems: entries.into_iter().map(|e| e.data).collect(),
        },
    }
}

fn split_on<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut at = 0;
    while at + needle.len() <= haystack.len() {
        if &haystack[at..at + needle.len()] == needle {
            out.push(&haystack[start..at]);
            at += needle.len();
            start = at;
        } else {
            at += 1;
        }
    }
    out.push(&haystack[start..]);
    out
}

fn split_once_bytes<'a>(haystack: &'a [u8], needle: &[u8]) -> Option<(&'a [u8], &'a [u8])> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|at| (&haystack[..at], &haystack[at + needle.len()..]))
}

fn strip_crlf(section: &[u8]) -> &[u8] {
    section.strip_prefix(b"\r\n".as_slice()).unwrap_or(section)
}

fn trim_trailing_crlf(body: &[u8]) -> &[u8] {
    body.strip_suffix(b"\r\n".as_slice()).unwrap_or(body)
}

fn strip_header<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (head, value) = line.split_once(':')?;
    if head.trim().eq_ignore_ascii_case(name) {
        Some(value.trim())
    } else {
        None
    }
}

fn disposition_name(value: &str) -> Option<String> {
    for param in value.split(';') {
        let param = param.trim();
        if let Some(rest) = param.strip_prefix("name=") {
            return Some(rest.trim_matches('"').to_string());
        }
    }
    None
}
