//! JSON byte-stream preprocessing.
//!
//! Real-world producers leak raw C0 control characters into JSON strings,
//! which strict decoders reject outright. Unescaped control characters are
//! stripped before decoding; a control character that immediately follows a
//! dangling escape is replaced by a second backslash, so the escape becomes
//! literal instead of silently applying to the next character.

pub fn sanitize_json(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    // Parity of the current backslash run: true means the next byte is
    // escaped.
    let mut escaped = false;
    for &b in input {
        if b == b'\\' {
            escaped = !escaped;
            out.push(b);
            continue;
        }
        if b < 0x20 {
            if escaped {
                out.push(b'\\');
            }
            escaped = false;
            continue;
        }
        escaped = false;
        out.push(b);
    }
    out
}
