//! Shared-secret authentication, checked in constant time.
//!
//! Grounded in the teacher's `api/client_auth.rs` middleware shape (axum
//! `from_fn_with_state`, credential extracted from `x-api-key` or
//! `Authorization: Bearer`), but the comparison itself does NOT reuse the
//! teacher's approach — that code explicitly compares client keys with a
//! plain `==` and a comment justifying it as acceptable, which conflicts
//! with spec §4.9's explicit constant-time requirement. The per-client
//! key→profile map is also dropped: this proxy has one upstream identity
//! pool, not per-client routing profiles.

/// Compare two byte strings in constant time (no early-exit on mismatch).
///
/// A hand-rolled XOR-accumulate loop is used rather than pulling in the
/// `subtle` crate, which the corpus doesn't otherwise reach for.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Extract the presented credential from either header, preferring
/// `x-api-key` (the Anthropic convention) over `Authorization: Bearer`.
pub fn extract_credential(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(v) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(v.to_string());
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Auth is disabled, or the credential matched.
    Admitted,
    Missing,
    Wrong,
}

/// Check a presented credential (if any) against the configured shared
/// secret (if any). When `shared_secret` is `None`, auth is disabled and
/// every request is admitted.
pub fn check(shared_secret: Option<&str>, presented: Option<&str>) -> AuthOutcome {
    let Some(secret) = shared_secret else {
        return AuthOutcome::Admitted;
    };
    match presented {
        None => AuthOutcome::Missing,
        Some(p) if constant_time_eq(p.as_bytes(), secret.as_bytes()) => AuthOutcome::Admitted,
        Some(_) => AuthOutcome::Wrong,
    }
}
