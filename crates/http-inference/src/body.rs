//! Body byte handling: Content-Encoding chains, bounded trial
//! decompression, and charset transcoding to UTF-8.

use std::io::Read;

use crate::BodyError;

// Trial decompression is bounded on both sides: at most this much input is
// examined and at most `TRIAL_MAX_OUT` may be produced.
const TRIAL_MAX_IN: usize = 1024 * 1024;
const TRIAL_MAX_OUT: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    /// RFC 2616 `deflate`, which is zlib-wrapped on the wire.
    Deflate,
    Brotli,
    Identity,
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Compression::Gzip => "gzip",
            Compression::Deflate => "deflate",
            Compression::Brotli => "br",
            Compression::Identity => "identity",
        };
        f.write_str(name)
    }
}

/// Parse a Content-Encoding header into its applied chain, in header order.
/// Unknown codings are an error; the caller logs and drops the body while
/// keeping the record.
pub fn parse_encoding_chain(header: &str) -> Result<Vec<Compression>, BodyError> {
    header
        .split(',')
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .map(|token| match token.as_str() {
            "gzip" | "x-gzip" => Ok(Compression::Gzip),
            "deflate" => Ok(Compression::Deflate),
            "br" => Ok(Compression::Brotli),
            "identity" => Ok(Compression::Identity),
            _ => Err(BodyError::UnsupportedEncoding(token)),
        })
        .collect()
}

/// Undo a Content-Encoding chain. Encodings were applied left to right, so
/// decoding runs in reverse.
pub fn decode_body(body: &[u8], chain: &[Compression]) -> Result<Vec<u8>, BodyError> {
    let mut current = body.to_vec();
    for compression in chain.iter().rev() {
        current = decompress_one(&current, *compression, u64::MAX)?;
    }
    Ok(current)
}

fn decompress_one(input: &[u8], compression: Compression, limit: u64) -> Result<Vec<u8>, BodyError> {
    let mut out = Vec::new();
    let result = match compression {
        Compression::Gzip => flate2::read::GzDecoder::new(input)
            .take(limit)
            .read_to_end(&mut out),
        Compression::Deflate => flate2::read::ZlibDecoder::new(input)
            .take(limit)
            .read_to_end(&mut out),
        Compression::Brotli => brotli::Decompressor::new(input, 4096)
            .take(limit)
            .read_to_end(&mut out),
        Compression::Identity => {
            out.extend_from_slice(input);
            Ok(out.len())
        }
    };
    result.map_err(BodyError::Decompress)?;
    Ok(out)
}

/// No Content-Encoding was declared but the primary decode failed: probe a
/// bounded prefix with each known algorithm and take the first clean read.
/// Raw deflate is probed as well as zlib-wrapped, since producers disagree.
pub fn trial_decompress(body: &[u8]) -> Option<Vec<u8>> {
    let probe = &body[..body.len().min(TRIAL_MAX_IN)];
    for compression in [Compression::Gzip, Compression::Deflate, Compression::Brotli] {
        if let Ok(out) = decompress_one(probe, compression, TRIAL_MAX_OUT) {
            if !out.is_empty() {
                return Some(out);
            }
        }
    }
    let mut out = Vec::new();
    if flate2::read::DeflateDecoder::new(probe)
        .take(TRIAL_MAX_OUT)
        .read_to_end(&mut out)
        .is_ok()
        && !out.is_empty()
    {
        return Some(out);
    }
    None
}

/// Transcode body bytes to UTF-8 per the `charset` Content-Type parameter.
/// With no declared charset, valid UTF-8 passes through and anything else is
/// run through encoding detection. An unknown label is a soft error surfaced
/// to the caller for logging.
pub fn transcode_utf8(body: &[u8], charset: Option<&str>) -> Result<String, BodyError> {
    let label = match charset {
        None => match std::str::from_utf8(body) {
            Ok(s) => return Ok(s.to_string()),
            Err(_) => {
                let mut detector = chardetng::EncodingDetector::new();
                detector.feed(body, true);
                let encoding = detector.guess(None, true);
                let (decoded, _, _) = encoding.decode(body);
                return Ok(decoded.into_owned());
            }
        },
        Some(label) => label,
    };
    let encoding = encoding_rs::Encoding::for_label(label.as_bytes())
        .ok_or_else(|| BodyError::UnknownCharset(label.to_string()))?;
    if encoding == encoding_rs::UTF_8 {
        return Ok(String::from_utf8_lossy(body).into_owned());
    }
    let (decoded, _, _) = encoding.decode(body);
    Ok(decoded.into_owned())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn chain_is_decoded_in_reverse() {
        let body = b"{\"hello\": \"world\"}";
        let wire = zlib(&gzip(body));
        let chain = parse_encoding_chain("gzip, deflate").unwrap();
        assert_eq!(body.to_vec(), decode_body(&wire, &chain).unwrap());
    }

    #[test]
    fn unknown_encoding_is_an_error() {
        assert!(matches!(
            parse_encoding_chain("gzip, snappy"),
            Err(BodyError::UnsupportedEncoding(token)) if token == "snappy"
        ));
    }

    #[test]
    fn identity_passes_through() {
        let chain = parse_encoding_chain("identity").unwrap();
        assert_eq!(b"abc".to_vec(), decode_body(b"abc", &chain).unwrap());
    }

    #[test]
    fn trial_decompression_detects_undeclared_gzip() {
        let body = b"some plain text that was gzipped without a header";
        assert_eq!(Some(body.to_vec()), trial_decompress(&gzip(body)));
    }

    #[test]
    fn transcode_handles_latin1() {
        let latin1 = [0x63, 0x61, 0x66, 0xe9]; // "cafe" with e-acute
        let out = transcode_utf8(&latin1, Some("iso-8859-1")).unwrap();
        assert_eq!("café", out);
    }

    #[test]
    fn unknown_charset_is_a_soft_error() {
        assert!(matches!(
            transcode_utf8(b"abc", Some("ebcdic-battlestar")),
            Err(BodyError::UnknownCharset(_))
        ));
    }
}
