//! Shared-token authentication
//!
//! The host agent is provisioned with a shared secret through its process
//! environment; clients obtain the same secret out-of-band. A connection
//! presents the token once, right after the socket opens, and is either
//! authorized for its lifetime or closed.
//!
//! # Security Model
//!
//! - Token is 32 bytes of cryptographically random data, hex-encoded (64 chars)
//! - Comparison is constant-time
//! - A failed handshake terminates the socket; there is no retry in-band
//!
//! The trust boundary is the loopback interface. The token keeps other local
//! processes from driving the host agent; it is not designed to authenticate
//! peers across an open network.

/// Environment variable carrying the shared secret
pub const TOKEN_ENV: &str = "HB_BRIDGE_TOKEN";

/// Length of the authentication token in bytes (before hex encoding)
const TOKEN_BYTES: usize = 32;

/// Generate a new random authentication token
///
/// Returns a 64-character hex string (32 random bytes)
pub fn generate_token() -> String {
    use rand::Rng;
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Read the configured token from the process environment
///
/// Returns `None` when no token is configured (the bridge then authorizes
/// every loopback connection implicitly) or when the variable is empty.
pub fn configured_token() -> Option<String> {
    match std::env::var(TOKEN_ENV) {
        Ok(token) if !token.trim().is_empty() => Some(token.trim().to_string()),
        _ => None,
    }
}

/// Validate a presented token against the configured token
///
/// Uses constant-time comparison to prevent timing attacks.
pub fn validate_token(provided: &str, expected: &str) -> bool {
    if provided.len() != expected.len() {
        return false;
    }

    let mut result = 0u8;
    for (a, b) in provided.bytes().zip(expected.bytes()) {
        result |= a ^ b;
    }
    result == 0
}
