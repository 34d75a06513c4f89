use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};

/// Decides whether a presented bearer token may open a socket or read the session index.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, presented: Option<&str>) -> bool;
}

/// A single shared secret. Only its digest is kept in memory.
pub struct StaticTokenVerifier {
    digest: [u8; 32],
}

impl StaticTokenVerifier {
    pub fn new(token: &str) -> Self {
        Self {
            digest: digest(token),
        }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, presented: Option<&str>) -> bool {
        match presented {
            Some(token) if !token.is_empty() => constant_time_eq(&digest(token), &self.digest),
            _ => false,
        }
    }
}

/// Accepts everything. Only installed when auth is explicitly switched off.
pub struct AllowAll;

impl TokenVerifier for AllowAll {
    fn verify(&self, _presented: Option<&str>) -> bool {
        true
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// `Authorization: Bearer` wins over the `token` query parameter, which browsers need because
/// they cannot set headers on a websocket upgrade.
pub fn presented_token<'a>(
    headers: &'a HeaderMap,
    query_token: Option<&'a str>,
) -> Option<&'a str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .or(query_token)
}
