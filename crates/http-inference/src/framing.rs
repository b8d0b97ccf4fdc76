//! HTTP/1.x message framing over reassembled half-streams.
//!
//! Heads are parsed with httparse; bodies are framed by Content-Length,
//! chunked transfer encoding, or read-to-close for responses that declare
//! neither. The HTTP/2 connection preface is recognized and surfaced as
//! unparsable so it lands in the unparsed counters.

use chrono::{DateTime, Utc};

use reassembly::{HalfContext, ParseStatus, ParserFactory, Probe, StreamParser};
use records::{Content, Headers, HttpRequest, HttpResponse, Observed};

const METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];
const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const MAX_HEADERS: usize = 64;

// Bodies larger than this are truncated in the record; framing still
// consumes them fully so the next message on the connection stays aligned.
const BODY_CAPTURE_CAP: usize = 1024 * 1024;

pub struct HttpRequestFactory;

impl ParserFactory for HttpRequestFactory {
    fn name(&self) -> &'static str {
        "http-request"
    }

    fn probe(&self, data: &[u8], _at_end: bool) -> Probe {
        // The HTTP/2 preface masquerades as a request line; claim it so it
        // can be surfaced as "detected, not parsed".
        if HTTP2_PREFACE.starts_with(data) && data.len() < HTTP2_PREFACE.len() {
            return Probe::NeedMoreData { skip: 0 };
        }
        if data.starts_with(HTTP2_PREFACE) {
            return Probe::Accept { skip: 0 };
        }
        for method in METHODS {
            let pattern = format!("{} ", method);
            let pattern = pattern.as_bytes();
            if data.starts_with(pattern) {
                return Probe::Accept { skip: 0 };
            }
            if pattern.starts_with(data) {
                return Probe::NeedMoreData { skip: 0 };
            }
        }
        Probe::Reject
    }

    fn build(&self, ctx: HalfContext) -> Box<dyn StreamParser> {
        Box::new(HttpMessageParser::new(Kind::Request, ctx))
    }
}

pub struct HttpResponseFactory;

impl ParserFactory for HttpResponseFactory {
    fn name(&self) -> &'static str {
        "http-response"
    }

    fn probe(&self, data: &[u8], _at_end: bool) -> Probe {
        const PREFIX: &[u8] = b"HTTP/1.";
        if data.starts_with(PREFIX) {
            return Probe::Accept { skip: 0 };
        }
        if PREFIX.starts_with(data) {
            return Probe::NeedMoreData { skip: 0 };
        }
        Probe::Reject
    }

    fn build(&self, ctx: HalfContext) -> Box<dyn StreamParser> {
        Box::new(HttpMessageParser::new(Kind::Response, ctx))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Request,
    Response,
}

#[derive(Debug)]
struct Head {
    method: String,
    path: String,
    query: Option<String>,
    host: String,
    status: u16,
    headers: Headers,
}

#[derive(Debug)]
enum Framing {
    Length { remaining: usize },
    Chunked(ChunkPhase),
    /// Response with neither Content-Length nor chunked framing: the body
    /// runs to connection close.
    ToClose,
}

#[derive(Debug)]
enum ChunkPhase {
    Size,
    Data { remaining: usize },
    DataCrlf,
    Trailer,
}

struct HttpMessageParser {
    kind: Kind,
    ctx: HalfContext,
    buf: Vec<u8>,
    head: Option<Head>,
    framing: Option<Framing>,
    body: Vec<u8>,
    body_dropped: usize,
    observed: Option<Observed>,
}

impl HttpMessageParser {
    fn new(kind: Kind, ctx: HalfContext) -> HttpMessageParser {
        HttpMessageParser {
            kind,
            ctx,
            buf: Vec::new(),
            head: None,
            framing: None,
            body: Vec::new(),
            body_dropped: 0,
            observed: None,
        }
    }
}

impl StreamParser for HttpMessageParser {
    fn feed(&mut self, data: &[u8], ts: DateTime<Utc>, end: bool) -> ParseStatus {
        if !data.is_empty() {
            self.observed
                .get_or_insert_with(|| Observed::at(ts))
                .extend(ts);
        }
        self.buf.extend_from_slice(data);

        if self.head.is_none() {
            match self.parse_head(end) {
                HeadStep::Ready => {}
                HeadStep::NeedMore => return ParseStatus::NeedMore,
                HeadStep::Failed(error) => {
                    return ParseStatus::Error {
                        held: std::mem::take(&mut self.buf),
                        error,
                    }
                }
            }
        }

        self.consume_body(ts, end)
    }
}

enum HeadStep {
    Ready,
    NeedMore,
    Failed(reassembly::ParserError),
}

impl HttpMessageParser {
    fn parse_head(&mut self, end: bool) -> HeadStep {
        if self.kind == Kind::Request && self.buf.starts_with(HTTP2_PREFACE) {
            tracing::debug!(stream = %self.ctx.stream, "HTTP/2 connection preface detected; not parsed");
            return HeadStep::Failed("HTTP/2 detected, not parsed".into());
        }

        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let (parsed, head_len) = match self.kind {
            Kind::Request => {
                let mut req = httparse::Request::new(&mut header_storage);
                match req.parse(&self.buf) {
                    Ok(httparse::Status::Complete(n)) => {
                        let target = req.path.unwrap_or("/").to_string();
                        let (path, query, target_host) = split_target(&target);
                        let headers = collect_headers(req.headers);
                        let host = target_host
                            .or_else(|| headers.get("host").map(str::to_string))
                            .unwrap_or_default();
                        (
                            Head {
                                method: req.method.unwrap_or_default().to_string(),
                                path,
                                query,
                                host,
                                status: 0,
                                headers,
                            },
                            n,
                        )
                    }
                    Ok(httparse::Status::Partial) => {
                        return if end {
                            HeadStep::Failed("stream ended inside a request head".into())
                        } else {
                            HeadStep::NeedMore
                        }
                    }
                    Err(err) => return HeadStep::Failed(Box::new(err)),
                }
            }
            Kind::Response => {
                let mut resp = httparse::Response::new(&mut header_storage);
                match resp.parse(&self.buf) {
                    Ok(httparse::Status::Complete(n)) => (
                        Head {
                            method: String::new(),
                            path: String::new(),
                            query: None,
                            host: String::new(),
                            status: resp.code.unwrap_or_default(),
                            headers: collect_headers(resp.headers),
                        },
                        n,
                    ),
                    Ok(httparse::Status::Partial) => {
                        return if end {
                            HeadStep::Failed("stream ended inside a response head".into())
                        } else {
                            HeadStep::NeedMore
                        }
                    }
                    Err(err) => return HeadStep::Failed(Box::new(err)),
                }
            }
        };

        self.buf.drain(..head_len);
        self.framing = Some(framing_for(self.kind, parsed.status, &parsed.headers));
        self.head = Some(parsed);
        HeadStep::Ready
    }

    fn consume_body(&mut self, ts: DateTime<Utc>, end: bool) -> ParseStatus {
        loop {
            // Framing is taken by value for the step so body capture and
            // completion can borrow the parser freely, then restored unless
            // the message completed.
            let framing = self.framing.take().expect("framing set with head");
            match framing {
                Framing::Length { mut remaining } => {
                    let take = remaining.min(self.buf.len());
                    let taken: Vec<u8> = self.buf.drain(..take).collect();
                    self.capture(&taken);
                    remaining -= take;
                    if remaining == 0 || end {
                        // remaining > 0 at end is a final partial record:
                        // the body is short but the head was sound.
                        return self.complete(ts);
                    }
                    self.framing = Some(Framing::Length { remaining });
                    return ParseStatus::NeedMore;
                }
                Framing::ToClose => {
                    let taken: Vec<u8> = std::mem::take(&mut self.buf);
                    self.capture(&taken);
                    if end {
                        return self.complete(ts);
                    }
                    self.framing = Some(Framing::ToClose);
                    return ParseStatus::NeedMore;
                }
                Framing::Chunked(phase) => match phase {
                    ChunkPhase::Size => {
                        let line_end = match find(&self.buf, b"\r\n") {
                            Some(at) => at,
                            None => return self.chunk_stall(ChunkPhase::Size, ts, end),
                        };
                        let line = String::from_utf8_lossy(&self.buf[..line_end]).into_owned();
                        let size_token = line.split(';').next().unwrap_or("").trim();
                        let size = match usize::from_str_radix(size_token, 16) {
                            Ok(size) => size,
                            Err(_) => {
                                return ParseStatus::Error {
                                    held: std::mem::take(&mut self.buf),
                                    error: format!("bad chunk size line: {:?}", line).into(),
                                }
                            }
                        };
                        self.buf.drain(..line_end + 2);
                        self.framing = Some(Framing::Chunked(if size == 0 {
                            ChunkPhase::Trailer
                        } else {
                            ChunkPhase::Data { remaining: size }
                        }));
                    }
                    ChunkPhase::Data { mut remaining } => {
                        let take = remaining.min(self.buf.len());
                        let taken: Vec<u8> = self.buf.drain(..take).collect();
                        self.capture(&taken);
                        remaining -= take;
                        if remaining > 0 {
                            return self.chunk_stall(ChunkPhase::Data { remaining }, ts, end);
                        }
                        self.framing = Some(Framing::Chunked(ChunkPhase::DataCrlf));
                    }
                    ChunkPhase::DataCrlf => {
                        if self.buf.len() < 2 {
                            return self.chunk_stall(ChunkPhase::DataCrlf, ts, end);
                        }
                        self.buf.drain(..2);
                        self.framing = Some(Framing::Chunked(ChunkPhase::Size));
                    }
                    ChunkPhase::Trailer => {
                        if self.buf.starts_with(b"\r\n") {
                            self.buf.drain(..2);
                            return self.complete(ts);
                        }
                        match find(&self.buf, b"\r\n\r\n") {
                            Some(at) => {
                                self.buf.drain(..at + 4);
                                return self.complete(ts);
                            }
                            None => return self.chunk_stall(ChunkPhase::Trailer, ts, end),
                        }
                    }
                },
            }
        }
    }

    /// Mid-chunk with no more bytes available. At end of stream the message
    /// is emitted with whatever body accumulated.
    fn chunk_stall(&mut self, phase: ChunkPhase, ts: DateTime<Utc>, end: bool) -> ParseStatus {
        if end {
            self.complete(ts)
        } else {
            self.framing = Some(Framing::Chunked(phase));
            ParseStatus::NeedMore
        }
    }

    fn capture(&mut self, bytes: &[u8]) {
        let room = BODY_CAPTURE_CAP.saturating_sub(self.body.len());
        let keep = bytes.len().min(room);
        self.body.extend_from_slice(&bytes[..keep]);
        self.body_dropped += bytes.len() - keep;
    }

    fn complete(&mut self, ts: DateTime<Utc>) -> ParseStatus {
        if self.body_dropped > 0 {
            tracing::debug!(
                stream = %self.ctx.stream,
                dropped = self.body_dropped,
                "body exceeded the capture cap; truncated"
            );
        }
        let head = self.head.take().expect("complete with a parsed head");
        let observed = self.observed.take().unwrap_or_else(|| Observed::at(ts));
        let body = std::mem::take(&mut self.body);
        let unused = std::mem::take(&mut self.buf);

        let content = match self.kind {
            Kind::Request => {
                let (headers, cookies) = extract_cookies(head.headers, "cookie");
                Content::Request(HttpRequest {
                    stream: self.ctx.stream,
                    seq: self.ctx.seq,
                    endpoints: self.ctx.endpoints,
                    observed,
                    method: head.method,
                    path: head.path,
                    query: head.query,
                    host: head.host,
                    headers,
                    cookies,
                    body,
                    body_decompressed: false,
                })
            }
            Kind::Response => {
                let (headers, cookies) = extract_cookies(head.headers, "set-cookie");
                Content::Response(HttpResponse {
                    stream: self.ctx.stream,
                    seq: self.ctx.seq,
                    endpoints: self.ctx.endpoints,
                    observed,
                    status: head.status,
                    headers,
                    cookies,
                    body,
                    body_decompressed: false,
                })
            }
        };
        ParseStatus::Done { content, unused }
    }
}

/// Split a request target into path, query, and (for absolute-form targets)
/// host.
fn split_target(target: &str) -> (String, Option<String>, Option<String>) {
    if target.starts_with("http://") || target.starts_with("https://") {
        if let Ok(url) = url::Url::parse(target) {
            let host = url.host_str().map(|h| match url.port() {
                Some(port) => format!("{}:{}", h, port),
                None => h.to_string(),
            });
            return (
                url.path().to_string(),
                url.query().map(str::to_string),
                host,
            );
        }
    }
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string()), None),
        None => (target.to_string(), None, None),
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Headers {
    let mut headers = Headers::default();
    for header in parsed {
        headers.push(
            header.name.to_string(),
            String::from_utf8_lossy(header.value).into_owned(),
        );
    }
    headers
}

/// Pull cookie headers out of the generic header set. Request `Cookie`
/// headers hold `name=value` pairs separated by semicolons; each response
/// `Set-Cookie` line holds one cookie followed by attributes.
fn extract_cookies(headers: Headers, name: &str) -> (Headers, Vec<(String, String)>) {
    let mut kept = Headers::default();
    let mut cookies = Vec::new();
    for (header_name, value) in headers.0 {
        if !header_name.eq_ignore_ascii_case(name) {
            kept.0.push((header_name, value));
            continue;
        }
        if name == "cookie" {
            for pair in value.split(';') {
                if let Some((k, v)) = pair.split_once('=') {
                    cookies.push((k.trim().to_string(), v.trim().to_string()));
                }
            }
        } else {
            let first = value.split(';').next().unwrap_or("");
            if let Some((k, v)) = first.split_once('=') {
                cookies.push((k.trim().to_string(), v.trim().to_string()));
            }
        }
    }
    (kept, cookies)
}

fn framing_for(kind: Kind, status: u16, headers: &Headers) -> Framing {
    let chunked = headers
        .get_all("transfer-encoding")
        .any(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return Framing::Chunked(ChunkPhase::Size);
    }
    if let Some(length) = headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        return Framing::Length { remaining: length };
    }
    match kind {
        Kind::Request => Framing::Length { remaining: 0 },
        // 1xx, 204 and 304 never carry a body.
        Kind::Response if status < 200 || status == 204 || status == 304 => {
            Framing::Length { remaining: 0 }
        }
        Kind::Response => Framing::ToClose,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod test {
    use super::*;
    use records::{Endpoints, StreamId};
    use std::net::{IpAddr, Ipv4Addr};

    fn ctx(seq: u32) -> HalfContext {
        HalfContext {
            stream: StreamId(9),
            endpoints: Endpoints {
                src_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                src_port: 51000,
                dst_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                dst_port: 8080,
            },
            seq,
        }
    }

    fn request(bytes: &[u8]) -> HttpRequest {
        let mut parser = HttpRequestFactory.build(ctx(0));
        match parser.feed(bytes, Utc::now(), false) {
            ParseStatus::Done {
                content: Content::Request(req),
                ..
            } => req,
            _ => panic!("expected a complete request"),
        }
    }

    #[test]
    fn simple_get_parses_method_host_and_path() {
        let req = request(
            b"GET /items?id=7 HTTP/1.1\r\nHost: localhost:8080\r\nAccept: */*\r\n\r\n",
        );
        assert_eq!("GET", req.method);
        assert_eq!("/items", req.path);
        assert_eq!(Some("id=7".to_string()), req.query);
        assert_eq!("localhost:8080", req.host);
        assert_eq!(Some("*/*"), req.headers.get("accept"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn cookie_headers_become_cookie_pairs() {
        let req = request(
            b"GET / HTTP/1.1\r\nHost: h\r\nCookie: sid=abc123; theme=dark\r\n\r\n",
        );
        assert_eq!(
            vec![
                ("sid".to_string(), "abc123".to_string()),
                ("theme".to_string(), "dark".to_string()),
            ],
            req.cookies,
        );
        assert!(!req.headers.contains("cookie"));
    }

    #[test]
    fn content_length_body_split_across_feeds() {
        let mut parser = HttpRequestFactory.build(ctx(0));
        let head = b"POST /v1 HTTP/1.1\r\nHost: h\r\nContent-Length: 11\r\n\r\nhello";
        assert!(matches!(
            parser.feed(head, Utc::now(), false),
            ParseStatus::NeedMore
        ));
        match parser.feed(b" world, next", Utc::now(), false) {
            ParseStatus::Done {
                content: Content::Request(req),
                unused,
            } => {
                assert_eq!(b"hello world".to_vec(), req.body);
                assert_eq!(b", next".to_vec(), unused);
            }
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn chunked_response_is_dechunked() {
        let mut parser = HttpResponseFactory.build(ctx(0));
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
            5\r\nhello\r\n6\r\n world\r\n0\r\n\r\nHTTP/1.1 ";
        match parser.feed(wire, Utc::now(), false) {
            ParseStatus::Done {
                content: Content::Response(resp),
                unused,
            } => {
                assert_eq!(200, resp.status);
                assert_eq!(b"hello world".to_vec(), resp.body);
                assert_eq!(b"HTTP/1.1 ".to_vec(), unused);
            }
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn response_without_length_reads_to_close() {
        let mut parser = HttpResponseFactory.build(ctx(0));
        assert!(matches!(
            parser.feed(b"HTTP/1.1 200 OK\r\n\r\npartial bo", Utc::now(), false),
            ParseStatus::NeedMore
        ));
        match parser.feed(b"dy", Utc::now(), true) {
            ParseStatus::Done {
                content: Content::Response(resp),
                ..
            } => assert_eq!(b"partial body".to_vec(), resp.body),
            _ => panic!("expected completion at end of stream"),
        }
    }

    #[test]
    fn set_cookie_lines_each_become_one_cookie() {
        let mut parser = HttpResponseFactory.build(ctx(0));
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\
            Set-Cookie: a=1; Path=/\r\nSet-Cookie: b=2; HttpOnly\r\n\r\n";
        match parser.feed(wire, Utc::now(), false) {
            ParseStatus::Done {
                content: Content::Response(resp),
                ..
            } => {
                assert_eq!(
                    vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())],
                    resp.cookies,
                );
            }
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn http2_preface_is_surfaced_as_unparsable() {
        let mut parser = HttpRequestFactory.build(ctx(0));
        match parser.feed(HTTP2_PREFACE, Utc::now(), false) {
            ParseStatus::Error { held, error } => {
                assert_eq!(HTTP2_PREFACE.to_vec(), held);
                assert!(error.to_string().contains("HTTP/2"));
            }
            _ => panic!("expected the preface to be rejected"),
        }
    }

    #[test]
    fn truncated_content_length_body_emits_partial_at_end() {
        let mut parser = HttpResponseFactory.build(ctx(2));
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 612\r\n\r\n<html>short";
        assert!(matches!(
            parser.feed(wire, Utc::now(), false),
            ParseStatus::NeedMore
        ));
        match parser.feed(b"", Utc::now(), true) {
            ParseStatus::Done {
                content: Content::Response(resp),
                ..
            } => assert_eq!(b"<html>short".to_vec(), resp.body),
            _ => panic!("expected a final partial record"),
        }
    }

    #[test]
    fn factory_probe_is_strict_about_non_http() {
        assert_eq!(
            Probe::Reject,
            HttpRequestFactory.probe(b"\x16\x03\x01\x00\x05", false)
        );
        assert_eq!(Probe::Accept { skip: 0 }, HttpRequestFactory.probe(b"GET /", false));
        assert_eq!(
            Probe::NeedMoreData { skip: 0 },
            HttpRequestFactory.probe(b"GE", false)
        );
        assert_eq!(
            Probe::Accept { skip: 0 },
            HttpResponseFactory.probe(b"HTTP/1.1 200 OK\r\n", false)
        );
    }
}
