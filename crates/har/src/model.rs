//! Serde model of the subset of HAR 1.2 we emit.

use serde::Serialize;

use records::{HttpRequest, HttpResponse};

#[derive(Debug, Serialize)]
pub struct Har {
    pub log: Log,
}

#[derive(Debug, Serialize)]
pub struct Log {
    pub version: String,
    pub creator: Creator,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Serialize)]
pub struct Creator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub started_date_time: String,
    /// Total time in milliseconds, when both halves were observed.
    pub time: f64,
    pub request: Request,
    pub response: Response,
    pub cache: serde_json::Value,
    pub timings: Timings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub headers: Vec<NameValue>,
    pub query_string: Vec<NameValue>,
    pub cookies: Vec<NameValue>,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub http_version: String,
    pub headers: Vec<NameValue>,
    pub cookies: Vec<NameValue>,
    pub content: Content,
    pub redirect_u_r_l: String,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub size: i64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct Timings {
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

fn name_values(pairs: impl Iterator<Item = (String, String)>) -> Vec<NameValue> {
    pairs
        .map(|(name, value)| NameValue { name, value })
        .collect()
}

/// Build one entry from a request and, when captured, its response.
pub(crate) fn entry(request: &HttpRequest, response: Option<&HttpResponse>) -> Entry {
    let url = format!(
        "http://{}{}{}",
        request.host,
        request.path,
        request
            .query
            .as_deref()
            .map(|q| format!("?{}", q))
            .unwrap_or_default()
    );
    let query_string = request
        .query
        .as_deref()
        .map(query::split_pairs)
        .unwrap_or_default();

    let time = response
        .map(|r| {
            (r.observed.first - request.observed.last)
                .num_microseconds()
                .map(|us| us as f64 / 1000.0)
                .unwrap_or(0.0)
        })
        .unwrap_or(-1.0);

    Entry {
        started_date_time: crate::har_time(request.observed.first),
        time,
        request: Request {
            method: request.method.clone(),
            url,
            http_version: "HTTP/1.1".to_string(),
            headers: name_values(request.headers.iter().map(|(n, v)| (n.to_string(), v.to_string()))),
            query_string,
            cookies: name_values(request.cookies.iter().cloned()),
            headers_size: -1,
            body_size: request.body.len() as i64,
        },
        response: match response {
            Some(resp) => Response {
                status: resp.status,
                status_text: String::new(),
                http_version: "HTTP/1.1".to_string(),
                headers: name_values(resp.headers.iter().map(|(n, v)| (n.to_string(), v.to_string()))),
                cookies: name_values(resp.cookies.iter().cloned()),
                content: Content {
                    size: resp.body.len() as i64,
                    mime_type: resp
                        .headers
                        .get("content-type")
                        .unwrap_or("application/octet-stream")
                        .to_string(),
                    text: Some(String::from_utf8_lossy(&resp.body).into_owned()),
                },
                redirect_u_r_l: String::new(),
                headers_size: -1,
                body_size: resp.body.len() as i64,
            },
            // Response never observed: a zero-status placeholder keeps the
            // entry valid for HAR viewers.
            None => Response {
                status: 0,
                status_text: String::new(),
                http_version: "HTTP/1.1".to_string(),
                headers: Vec::new(),
                cookies: Vec::new(),
                content: Content {
                    size: 0,
                    mime_type: String::new(),
                    text: None,
                },
                redirect_u_r_l: String::new(),
                headers_size: -1,
                body_size: 0,
            },
        },
        cache: serde_json::json!({}),
        timings: Timings {
            send: 0.0,
            wait: time.max(0.0),
            receive: 0.0,
        },
    }
}

mod query {
    use super::NameValue;

    /// Split a raw query string into HAR queryString pairs without
    /// percent-decoding; HAR viewers expect the raw forms.
    pub(super) fn split_pairs(query: &str) -> Vec<NameValue> {
        query
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((name, value)) => NameValue {
                    name: name.to_string(),
                    value: value.to_string(),
                },
                None => NameValue {
                    name: part.to_string(),
                    value: String::new(),
                },
            })
            .collect()
    }
}
