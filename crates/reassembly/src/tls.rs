//! TLS handshake hints: recognize ClientHello / ServerHello at the head of
//! a half-stream and surface SNI and protocol versions. Nothing is ever
//! decrypted; everything after the hello is left for raw accounting.

use chrono::{DateTime, Utc};

use records::{Content, Observed, TlsClientHello, TlsServerHello, TlsVersion};

use crate::harness::{HalfContext, ParseStatus, ParserFactory, Probe, StreamParser};

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_SERVER_HELLO: u8 = 2;

const EXT_SERVER_NAME: u16 = 0;
const EXT_SUPPORTED_VERSIONS: u16 = 43;

pub struct TlsFactory;

impl ParserFactory for TlsFactory {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn probe(&self, data: &[u8], _at_end: bool) -> Probe {
        // Record header: type, major version, minor version, length.
        for &(i, expect) in &[(0usize, CONTENT_TYPE_HANDSHAKE), (1, 0x03)] {
            match data.get(i) {
                Some(&b) if b == expect => {}
                Some(_) => return Probe::Reject,
                None => return Probe::NeedMoreData { skip: 0 },
            }
        }
        match data.get(2) {
            Some(&minor) if minor <= 0x04 => {}
            Some(_) => return Probe::Reject,
            None => return Probe::NeedMoreData { skip: 0 },
        }
        match data.get(5) {
            Some(&HANDSHAKE_CLIENT_HELLO) | Some(&HANDSHAKE_SERVER_HELLO) => Probe::Accept { skip: 0 },
            Some(_) => Probe::Reject,
            None => Probe::NeedMoreData { skip: 0 },
        }
    }

    fn build(&self, ctx: HalfContext) -> Box<dyn StreamParser> {
        Box::new(TlsParser {
            ctx,
            buf: Vec::new(),
            first_ts: None,
        })
    }
}

struct TlsParser {
    ctx: HalfContext,
    buf: Vec<u8>,
    first_ts: Option<DateTime<Utc>>,
}

impl StreamParser for TlsParser {
    fn feed(&mut self, data: &[u8], ts: DateTime<Utc>, end: bool) -> ParseStatus {
        if self.first_ts.is_none() && !data.is_empty() {
            self.first_ts = Some(ts);
        }
        self.buf.extend_from_slice(data);

        if self.buf.len() < 5 {
            return self.need_more(end, "stream ended inside a TLS record header");
        }
        let record_len = u16::from_be_bytes([self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < 5 + record_len {
            return self.need_more(end, "stream ended inside a TLS handshake record");
        }

        let observed = Observed::at(self.first_ts.unwrap_or(ts));
        let record = &self.buf[5..5 + record_len];
        let parsed = match record.first() {
            Some(&HANDSHAKE_CLIENT_HELLO) => {
                parse_client_hello(record).map(|(sni, offered_versions)| {
                    Content::TlsClientHello(TlsClientHello {
                        stream: self.ctx.stream,
                        endpoints: self.ctx.endpoints,
                        observed,
                        sni,
                        offered_versions,
                    })
                })
            }
            Some(&HANDSHAKE_SERVER_HELLO) => parse_server_hello(record).map(|selected_version| {
                Content::TlsServerHello(TlsServerHello {
                    stream: self.ctx.stream,
                    endpoints: self.ctx.endpoints,
                    observed,
                    selected_version,
                })
            }),
            _ => None,
        };

        match parsed {
            Some(content) => ParseStatus::Done {
                content,
                unused: self.buf.split_off(5 + record_len),
            },
            None => ParseStatus::Error {
                held: std::mem::take(&mut self.buf),
                error: "malformed TLS hello".into(),
            },
        }
    }
}

impl TlsParser {
    fn need_more(&mut self, end: bool, message: &'static str) -> ParseStatus {
        if end {
            ParseStatus::Error {
                held: std::mem::take(&mut self.buf),
                error: message.into(),
            }
        } else {
            ParseStatus::NeedMore
        }
    }
}

/// Cursor over handshake bytes; every read is bounds-checked so truncated
/// hellos surface as None rather than a panic.
struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.0.len() < n {
            return None;
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}

fn version_of(wire: u16) -> Option<TlsVersion> {
    match wire {
        0x0300 => Some(TlsVersion::Ssl3),
        0x0301 => Some(TlsVersion::Tls1_0),
        0x0302 => Some(TlsVersion::Tls1_1),
        0x0303 => Some(TlsVersion::Tls1_2),
        0x0304 => Some(TlsVersion::Tls1_3),
        _ => None,
    }
}

/// Walk a ClientHello handshake message for SNI and offered versions.
fn parse_client_hello(message: &[u8]) -> Option<(Option<String>, Vec<TlsVersion>)> {
    let mut r = Reader(message);
    r.take(4)?; // handshake type + 24-bit length
    let legacy_version = r.u16()?;
    r.take(32)?; // random
    let session_id_len = r.u8()? as usize;
    r.take(session_id_len)?;
    let cipher_suites_len = r.u16()? as usize;
    r.take(cipher_suites_len)?;
    let compression_len = r.u8()? as usize;
    r.take(compression_len)?;

    let mut sni = None;
    let mut offered = Vec::new();

    // Extensions are optional in older hellos.
    if let Some(extensions_len) = r.u16() {
        let mut ext = Reader(r.take(extensions_len as usize)?);
        while let Some(ext_type) = ext.u16() {
            let ext_len = ext.u16()? as usize;
            let body = ext.take(ext_len)?;
            match ext_type {
                EXT_SERVER_NAME => {
                    let mut names = Reader(body);
                    names.u16()?; // server_name_list length
                    let name_type = names.u8()?;
                    let name_len = names.u16()? as usize;
                    if name_type == 0 {
                        let name = names.take(name_len)?;
                        sni = String::from_utf8(name.to_vec()).ok();
                    }
                }
                EXT_SUPPORTED_VERSIONS => {
                    let mut versions = Reader(body);
                    let list_len = versions.u8()? as usize;
                    let mut list = Reader(versions.take(list_len)?);
                    while let Some(wire) = list.u16() {
                        if let Some(v) = version_of(wire) {
                            offered.push(v);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    if offered.is_empty() {
        if let Some(v) = version_of(legacy_version) {
            offered.push(v);
        }
    }
    Some((sni, offered))
}

/// Walk a ServerHello for the selected version.
fn parse_server_hello(message: &[u8]) -> Option<Option<TlsVersion>> {
    let mut r = Reader(message);
    r.take(4)?;
    let legacy_version = r.u16()?;
    r.take(32)?;
    let session_id_len = r.u8()? as usize;
    r.take(session_id_len)?;
    r.u16()?; // cipher suite
    r.u8()?; // compression method

    let mut selected = version_of(legacy_version);
    if let Some(extensions_len) = r.u16() {
        if let Some(extensions) = r.take(extensions_len as usize) {
            let mut ext = Reader(extensions);
            while let Some(ext_type) = ext.u16() {
                let ext_len = ext.u16()? as usize;
                let body = ext.take(ext_len)?;
                if ext_type == EXT_SUPPORTED_VERSIONS && body.len() >= 2 {
                    selected = version_of(u16::from_be_bytes([body[0], body[1]]));
                }
            }
        }
    }
    Some(selected)
}

#[cfg(test)]
mod test {
    use super::*;
    use records::{Endpoints, StreamId};
    use std::net::{IpAddr, Ipv4Addr};

    fn ctx() -> HalfContext {
        HalfContext {
            stream: StreamId(1),
            endpoints: Endpoints {
                src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                src_port: 44321,
                dst_ip: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
                dst_port: 443,
            },
            seq: 0,
        }
    }

    /// Build a minimal ClientHello with an SNI and supported_versions
    /// extension, wrapped in a handshake record.
    fn client_hello(host: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes()); // legacy version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression methods
        body.push(0);

        let mut sni_ext = Vec::new();
        let name = host.as_bytes();
        sni_ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        sni_ext.push(0); // host_name
        sni_ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(name);

        let mut versions_ext = vec![4u8];
        versions_ext.extend_from_slice(&0x0304u16.to_be_bytes());
        versions_ext.extend_from_slice(&0x0303u16.to_be_bytes());

        let mut extensions = Vec::new();
        for (ext_type, ext_body) in [(EXT_SERVER_NAME, &sni_ext), (EXT_SUPPORTED_VERSIONS, &versions_ext)] {
            extensions.extend_from_slice(&ext_type.to_be_bytes());
            extensions.extend_from_slice(&(ext_body.len() as u16).to_be_bytes());
            extensions.extend_from_slice(ext_body);
        }
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]); // 24-bit length
        handshake.extend_from_slice(&body);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn probe_accepts_handshake_prefix_only() {
        let hello = client_hello("example.com");
        assert_eq!(Probe::Accept { skip: 0 }, TlsFactory.probe(&hello, false));
        assert_eq!(
            Probe::NeedMoreData { skip: 0 },
            TlsFactory.probe(&hello[..3], false)
        );
        assert_eq!(Probe::Reject, TlsFactory.probe(b"GET / HTTP/1.1", false));
    }

    #[test]
    fn client_hello_yields_sni_and_versions() {
        let mut parser = TlsFactory.build(ctx());
        let hello = client_hello("api.internal.example");
        match parser.feed(&hello, Utc::now(), false) {
            ParseStatus::Done { content, unused } => {
                assert!(unused.is_empty());
                match content {
                    Content::TlsClientHello(h) => {
                        assert_eq!(Some("api.internal.example".to_string()), h.sni);
                        assert_eq!(
                            vec![TlsVersion::Tls1_3, TlsVersion::Tls1_2],
                            h.offered_versions
                        );
                    }
                    other => panic!("unexpected content: {:?}", other),
                }
            }
            _ => panic!("expected a complete hello"),
        }
    }

    #[test]
    fn split_hello_waits_for_more_data() {
        let mut parser = TlsFactory.build(ctx());
        let hello = client_hello("example.com");
        assert!(matches!(
            parser.feed(&hello[..10], Utc::now(), false),
            ParseStatus::NeedMore
        ));
        assert!(matches!(
            parser.feed(&hello[10..], Utc::now(), false),
            ParseStatus::Done { .. }
        ));
    }
}
