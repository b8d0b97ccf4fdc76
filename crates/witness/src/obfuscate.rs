//! One-way obfuscation of sensitive primitive values.
//!
//! Every primitive leaf that leaves the process is replaced by a
//! deterministic surrogate of the same type. Strings and bytes keep their
//! length; integers and floats keep their width. The surrogate is derived
//! from an xxh3 digest of the original value, so the mapping is stable
//! within and across runs but cannot be inverted. What survives is the type
//! tag and a coarse format category recognized before replacement.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::data::{Data, Primitive, Value};

/// Format category of a string value, recognized before obfuscation so the
/// shape survives even though the value does not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    #[default]
    Plain,
    /// Luhn-valid digit string of at least 13 digits.
    PaymentCard,
    Email,
    Timestamp,
}

impl FormatKind {
    pub fn is_plain(&self) -> bool {
        *self == FormatKind::Plain
    }
}

lazy_static! {
    static ref EMAIL: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

/// Categorize a string value. Applied to leaves before their value is
/// replaced by a surrogate.
pub fn categorize(s: &str) -> FormatKind {
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 13 && digits.len() == s.chars().filter(|c| !c.is_whitespace() && *c != '-').count() && luhn_valid(&digits) {
        return FormatKind::PaymentCard;
    }
    if EMAIL.is_match(s) {
        return FormatKind::Email;
    }
    if chrono::DateTime::parse_from_rfc3339(s).is_ok() {
        return FormatKind::Timestamp;
    }
    FormatKind::Plain
}

/// Luhn checksum over an all-digit string.
fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0u32;
    for (i, c) in digits.chars().rev().enumerate() {
        let mut d = match c.to_digit(10) {
            Some(d) => d,
            None => return false,
        };
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

/// Obfuscate every primitive leaf of the tree in place.
pub fn obfuscate_tree(data: &mut Data) {
    match data {
        Data::Primitive(p) => obfuscate_primitive(p),
        Data::Struct { fields } => {
            for child in fields.values_mut() {
                obfuscate_tree(child);
            }
        }
        Data::List { elems } => {
            for child in elems {
                obfuscate_tree(child);
            }
        }
        Data::OneOf { variants, .. } => {
            for child in variants.values_mut() {
                obfuscate_tree(child);
            }
        }
        Data::None => {}
    }
}

pub fn obfuscate_primitive(p: &mut Primitive) {
    p.value = match &p.value {
        Value::Bool(b) => Value::Bool(xxh3_64(&[*b as u8]) & 1 == 1),
        Value::Int(n) => {
            let d = xxh3_64(&n.to_le_bytes());
            Value::Int((d & 0x7fff_ffff_ffff_ffff) as i64)
        }
        Value::Uint(n) => Value::Uint(xxh3_64(&n.to_le_bytes())),
        Value::Float(n) => {
            let d = xxh3_64(&n.to_bits().to_le_bytes());
            // Fold the digest into a finite float in [0, 1).
            Value::Float((d >> 11) as f64 / (1u64 << 53) as f64)
        }
        Value::String(s) => {
            if p.format.is_plain() {
                p.format = categorize(s);
            }
            Value::String(surrogate_string(s))
        }
        Value::Bytes(b) => Value::Bytes(surrogate_bytes(b)),
    };
}

const ALPHA: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const DIGITS: &[u8] = b"0123456789";

/// Length-preserving string surrogate. All-digit inputs map to all-digit
/// surrogates so downstream consumers keep their notion of the value class.
fn surrogate_string(s: &str) -> String {
    let all_digits = !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    let alphabet = if all_digits { DIGITS } else { ALPHA };
    let mut state = xxh3_64(s.as_bytes()) | 1;
    let mut out = String::with_capacity(s.chars().count());
    for _ in s.chars() {
        state = xorshift(state);
        out.push(alphabet[(state % alphabet.len() as u64) as usize] as char);
    }
    out
}

fn surrogate_bytes(b: &[u8]) -> Vec<u8> {
    let mut state = xxh3_64(b) | 1;
    let mut out = Vec::with_capacity(b.len());
    for _ in 0..b.len() {
        state = xorshift(state);
        out.push((state & 0xff) as u8);
    }
    out
}

fn xorshift(mut s: u64) -> u64 {
    s ^= s << 13;
    s ^= s >> 7;
    s ^= s << 17;
    s
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn luhn_recognizes_test_pans() {
        // Standard test card numbers.
        assert_eq!(FormatKind::PaymentCard, categorize("4111111111111111"));
        assert_eq!(FormatKind::PaymentCard, categorize("5500-0000-0000-0004"));
        // Fails the checksum.
        assert_eq!(FormatKind::Plain, categorize("4111111111111112"));
        // Too short, even though Luhn-valid.
        assert_eq!(FormatKind::Plain, categorize("79927398713"));
    }

    #[test]
    fn categorize_recognizes_email_and_timestamp() {
        assert_eq!(FormatKind::Email, categorize("user@example.com"));
        assert_eq!(
            FormatKind::Timestamp,
            categorize("2024-03-01T12:30:00+00:00")
        );
        assert_eq!(FormatKind::Plain, categorize("hello world"));
    }

    #[test]
    fn surrogate_preserves_length_and_forgets_content() {
        let secret = "super-secret-token-value";
        let surrogate = surrogate_string(secret);
        assert_eq!(secret.len(), surrogate.len());
        assert!(!surrogate.contains("secret"));
        // Deterministic.
        assert_eq!(surrogate, surrogate_string(secret));
        // Distinct inputs get distinct surrogates.
        assert_ne!(surrogate, surrogate_string("super-secret-token-valuf"));
    }

    #[test]
    fn digit_inputs_stay_digits() {
        let surrogate = surrogate_string("4111111111111111");
        assert_eq!(16, surrogate.len());
        assert!(surrogate.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn obfuscation_is_total_over_a_tree() {
        let mut tree = Data::Struct {
            fields: [
                ("token".to_string(), Data::string("tok_live_abcdef")),
                ("n".to_string(), Data::int(42)),
            ]
            .into_iter()
            .collect(),
        };
        obfuscate_tree(&mut tree);
        tree.visit_primitives(&mut |p| match &p.value {
            Value::String(s) => assert!(!s.contains("tok_live")),
            Value::Int(n) => assert_ne!(42, *n),
            other => panic!("unexpected leaf: {:?}", other),
        });
    }
}
