use serde::{Deserialize, Serialize};

/// Where in the HTTP transaction a piece of data was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "at", rename_all = "snake_case")]
pub enum Location {
    Query { key: String },
    Header { key: String },
    Cookie { key: String },
    Body { content_type: String },
    Multipart { subtype: String },
    Auth { scheme: AuthScheme },
}

/// Location metadata attached to each top-level data entry of a witness.
/// `status` is present only for response-side entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(flatten)]
    pub location: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl Meta {
    pub fn request(location: Location) -> Meta {
        Meta {
            location,
            status: None,
        }
    }

    pub fn response(location: Location, status: u16) -> Meta {
        Meta {
            location,
            status: Some(status),
        }
    }
}

/// Authorization schemes recognized from the `Authorization` request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
    Bearer,
    Basic,
    Digest,
    Mutual,
    Oauth,
    Vapid,
    ScramSha1,
    ScramSha256,
    Negotiate,
    Hoba,
    Aws4HmacSha256,
    Ntlm,
    /// A known vendor-specific auth header, e.g. X-Hub-Signature.
    Proprietary,
    Unknown,
}

// Prefix table over the Authorization credential. Order matters: scram-sha-256
// must be probed before scram-sha-1 would otherwise shadow it.
const SCHEME_PREFIXES: &[(&str, AuthScheme)] = &[
    ("bearer", AuthScheme::Bearer),
    ("basic", AuthScheme::Basic),
    ("digest", AuthScheme::Digest),
    ("mutual", AuthScheme::Mutual),
    ("oauth", AuthScheme::Oauth),
    ("vapid", AuthScheme::Vapid),
    ("scram-sha-256", AuthScheme::ScramSha256),
    ("scram-sha-1", AuthScheme::ScramSha1),
    ("negotiate", AuthScheme::Negotiate),
    ("hoba", AuthScheme::Hoba),
    ("aws4-hmac-sha256", AuthScheme::Aws4HmacSha256),
    ("ntlm", AuthScheme::Ntlm),
];

impl AuthScheme {
    /// Derive the scheme from an Authorization header value by
    /// case-insensitive prefix match.
    pub fn from_credential(value: &str) -> AuthScheme {
        let lowered = value.trim_start().to_ascii_lowercase();
        for (prefix, scheme) in SCHEME_PREFIXES {
            if lowered.starts_with(prefix) {
                return *scheme;
            }
        }
        AuthScheme::Unknown
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scheme_prefix_table() {
        assert_eq!(
            AuthScheme::Bearer,
            AuthScheme::from_credential("Bearer abc.def.ghi")
        );
        assert_eq!(
            AuthScheme::ScramSha256,
            AuthScheme::from_credential("SCRAM-SHA-256 n,,n=user")
        );
        assert_eq!(
            AuthScheme::ScramSha1,
            AuthScheme::from_credential("SCRAM-SHA-1 n,,n=user")
        );
        assert_eq!(
            AuthScheme::Aws4HmacSha256,
            AuthScheme::from_credential("AWS4-HMAC-SHA256 Credential=AKID/x")
        );
        assert_eq!(
            AuthScheme::Unknown,
            AuthScheme::from_credential("Hawk id=\"dh37\"")
        );
    }
}
