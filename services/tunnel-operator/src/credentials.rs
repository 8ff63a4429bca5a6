//! Tunnel Secret Generation
//!
//! Produces the shared secret a tunnel is registered with. Generated once at
//! tunnel creation, never rotated implicitly.

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rngs::OsRng, RngCore};
use tracing::debug;

/// Raw secret length; the provider requires at least 32 bytes.
pub const TUNNEL_SECRET_BYTES: usize = 32;

/// A freshly generated tunnel secret, base64 encoded as the provider expects
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelSecret(String);

impl TunnelSecret {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Never print the secret itself.
impl std::fmt::Debug for TunnelSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TunnelSecret(<redacted>)")
    }
}

/// Generate a high-entropy tunnel secret from the OS random number generator
pub fn generate_tunnel_secret() -> TunnelSecret {
    let mut bytes = [0u8; TUNNEL_SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);

    debug!(bytes = TUNNEL_SECRET_BYTES, "Generated tunnel secret");

    TunnelSecret(STANDARD.encode(bytes))
}
