//! Device signing identity
//!
//! Every device holds one long-lived ed25519 keypair. Outgoing envelopes
//! are signed with it; peers verify against the trusted public keys the
//! editor shell has exchanged out of band (key exchange itself is outside
//! the sync core).

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::{SyncError, SyncResult};

/// Long-lived ed25519 signing keypair for one device
#[derive(Clone)]
pub struct DeviceKeypair {
    signing_key: SigningKey,
}

impl DeviceKeypair {
    /// Generate a new random keypair
    pub fn generate() -> SyncResult<Self> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| SyncError::Identity(format!("Failed to gather entropy: {}", e)))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Reconstruct a keypair from a stored 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// The 32-byte seed, for persistence
    pub fn to_seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The public half, handed to peers during out-of-band key exchange
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

/// Verify a detached signature against a peer's public key
pub fn verify_signature(
    key: &VerifyingKey,
    message: &[u8],
    signature_bytes: &[u8],
) -> SyncResult<()> {
    let signature = Signature::from_slice(signature_bytes)
        .map_err(|e| SyncError::SignatureInvalid(format!("Malformed signature: {}", e)))?;
    key.verify(message, &signature)
        .map_err(|e| SyncError::SignatureInvalid(format!("{}", e)))
}

impl std::fmt::Debug for DeviceKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the seed; the public-key prefix is enough to tell
        // keypairs apart in logs.
        let public = self.verifying_key();
        f.debug_struct("DeviceKeypair")
            .field("public", &hex::encode(&public.as_bytes()[..6]))
            .finish()
    }
}
