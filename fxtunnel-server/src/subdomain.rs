// Subdomain validation and generation

use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

/// Length of generated random labels
const RANDOM_LABEL_LEN: usize = 8;

fn subdomain_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,30}[a-z0-9])?$").unwrap())
}

/// Whether a (lowercased) label is a valid subdomain
pub fn is_valid(subdomain: &str) -> bool {
    subdomain_regex().is_match(subdomain)
}

/// Lowercase and validate a requested subdomain
pub fn normalize(requested: &str) -> Option<String> {
    let lowered = requested.trim().to_ascii_lowercase();
    if is_valid(&lowered) {
        Some(lowered)
    } else {
        None
    }
}

/// Generate a random 8-character label
pub fn random_label() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..RANDOM_LABEL_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Match a subdomain against a token's allow-list glob
/// (`*` matches any run of characters)
pub fn glob_match(pattern: &str, subdomain: &str) -> bool {
    fn inner(p: &[u8], s: &[u8]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], s) || (!s.is_empty() && inner(p, &s[1..]))
            }
            (Some(pc), Some(sc)) if pc == sc => inner(&p[1..], &s[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), subdomain.as_bytes())
}

/// Whether a token allow-list permits a subdomain; an empty list allows all
pub fn allowed_by(patterns: &[String], subdomain: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| glob_match(p, subdomain))
}
