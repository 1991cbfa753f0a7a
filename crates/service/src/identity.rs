use crate::error::Error;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use busrpc_messaging::HeaderMap;
use busrpc_messaging::headers::{IDENTITY, SIGNATURE, TIMESTAMP};
use ed25519_dalek::{PUBLIC_KEY_LENGTH, Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Hex encoding of a public key, as carried in the `identity` header.
#[must_use]
pub fn encode_identity(key: &VerifyingKey) -> String {
    hex::encode(key.as_bytes())
}

/// Decodes an `identity` header value.
///
/// # Errors
/// Returns `InvalidIdentity` for bad hex, a wrong length or a point that is
/// not a valid key.
pub fn decode_identity(identity: &str) -> Result<VerifyingKey, Error> {
    let bytes = hex::decode(identity).map_err(|_| Error::InvalidIdentity)?;
    let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidIdentity)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| Error::InvalidIdentity)
}

/// Current time in unix nanoseconds.
#[must_use]
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX)
        })
}

/// The local signing identity plus the allowlist of remote identities.
#[derive(Clone, Debug, Default)]
pub struct Identity {
    signing_key: Option<SigningKey>,
    public: Option<String>,
    known: HashMap<String, VerifyingKey>,
}

impl Identity {
    /// Creates an identity. Without a signing key nothing is signed; an
    /// empty allowlist accepts self-asserted identities.
    #[must_use]
    pub fn new(signing_key: Option<SigningKey>, known: HashMap<String, VerifyingKey>) -> Self {
        let public = signing_key
            .as_ref()
            .map(|key| encode_identity(&key.verifying_key()));
        let known = known
            .into_iter()
            .map(|(identity, key)| (identity.to_ascii_lowercase(), key))
            .collect();

        Self {
            signing_key,
            public,
            known,
        }
    }

    /// The encoded public identity, if a signing key is configured.
    #[must_use]
    pub fn public(&self) -> Option<&str> {
        self.public.as_deref()
    }

    /// Signs `payload`, returning the encoded identity and signature.
    #[must_use]
    pub fn sign(&self, payload: &[u8]) -> Option<(String, String)> {
        let key = self.signing_key.as_ref()?;
        let public = self.public.clone()?;
        let signature = key.sign(payload);
        Some((public, STANDARD.encode(signature.to_bytes())))
    }

    /// Writes the identity, signature and timestamp headers.
    pub fn stamp(&self, headers: &mut HeaderMap, payload: &[u8]) {
        if let Some((identity, signature)) = self.sign(payload) {
            headers.insert(IDENTITY, identity);
            headers.insert(SIGNATURE, signature);
        }
        headers.insert(TIMESTAMP, unix_nanos().to_string());
    }

    /// Verifies the envelope headers against `payload`.
    ///
    /// # Errors
    /// `UnknownIdentity` when an allowlist is configured and the sender is not
    /// on it, `InvalidIdentity` for an undecodable self-asserted identity,
    /// `MalformedSignature` and `InvalidSignature` for signature failures.
    pub fn verify(&self, headers: &HeaderMap, payload: &[u8]) -> Result<(), Error> {
        let identity = headers.get(IDENTITY).unwrap_or_default();
        let signature = headers.get(SIGNATURE).unwrap_or_default();

        let key = if !self.known.is_empty() {
            *self
                .known
                .get(&identity.to_ascii_lowercase())
                .ok_or_else(|| Error::UnknownIdentity(identity.to_string()))?
        } else if identity.is_empty() && signature.is_empty() {
            return Ok(());
        } else {
            decode_identity(identity)?
        };

        let signature = STANDARD
            .decode(signature)
            .map_err(|_| Error::MalformedSignature)?;
        let signature =
            Signature::from_slice(&signature).map_err(|_| Error::MalformedSignature)?;

        key.verify(payload, &signature)
            .map_err(|_| Error::InvalidSignature)
    }
}
