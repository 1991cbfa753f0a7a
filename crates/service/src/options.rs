use crate::error::Error;
use crate::identity::{decode_identity, encode_identity};

use std::collections::HashMap;
use std::time::Duration;

use ed25519_dalek::{SECRET_KEY_LENGTH, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

const DEFAULT_PREFIX: &str = "busrpc";
const DEFAULT_NAME: &str = "rnd";
const DEFAULT_QUEUE_SIZE: usize = 1000;
const DEFAULT_TELEMETRY_PERIOD: Duration = Duration::from_secs(10);

/// Options for a [`crate::Service`].
#[derive(Clone, Debug)]
pub struct ServiceOptions {
    /// First subject token of everything the service publishes.
    pub prefix: String,

    /// Second subject token.
    pub name: String,

    /// Queue group for subscriptions, if any.
    pub queue_name: Option<String>,

    /// Capacity of the outbound publish queue.
    pub publish_queue_size: usize,

    /// Capacity of client stream receive queues.
    pub subscribe_queue_size: usize,

    /// Interval between telemetry reports.
    pub telemetry_period: Duration,

    /// Log every subscription and delivery.
    pub verbose: bool,

    /// Key used to sign outbound envelopes.
    pub signing_key: Option<SigningKey>,

    /// Allowlist of remote identities. Empty accepts self-asserted identities.
    pub known_identities: HashMap<String, VerifyingKey>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            name: DEFAULT_NAME.to_string(),
            queue_name: None,
            publish_queue_size: DEFAULT_QUEUE_SIZE,
            subscribe_queue_size: DEFAULT_QUEUE_SIZE,
            telemetry_period: DEFAULT_TELEMETRY_PERIOD,
            verbose: false,
            signing_key: None,
            known_identities: HashMap::new(),
        }
    }
}

impl ServiceOptions {
    /// Sets the signing key.
    #[must_use]
    pub fn with_signing_key(mut self, signing_key: SigningKey) -> Self {
        self.signing_key = Some(signing_key);
        self
    }

    /// Adds hex-encoded identities to the allowlist. Malformed entries are
    /// skipped.
    #[must_use]
    pub fn with_known_identities<I, S>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for identity in identities {
            if let Ok(key) = decode_identity(identity.as_ref()) {
                self.known_identities.insert(encode_identity(&key), key);
            }
        }
        self
    }

    /// Adds public keys to the allowlist.
    #[must_use]
    pub fn with_known_public_keys<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = VerifyingKey>,
    {
        for key in keys {
            self.known_identities.insert(encode_identity(&key), key);
        }
        self
    }

    /// Checks the options.
    ///
    /// # Errors
    /// Returns an error for an empty prefix or name, or a zero queue size.
    pub fn validate(&self) -> Result<(), Error> {
        if self.prefix.trim().is_empty() {
            return Err(Error::InvalidOptions("prefix is empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidOptions("name is empty".to_string()));
        }
        if self.publish_queue_size == 0 {
            return Err(Error::InvalidOptions(
                "publish queue size is zero".to_string(),
            ));
        }
        if self.subscribe_queue_size == 0 {
            return Err(Error::InvalidOptions(
                "subscribe queue size is zero".to_string(),
            ));
        }
        if self.telemetry_period.is_zero() {
            return Err(Error::InvalidOptions(
                "telemetry period is zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serializable form of [`ServiceOptions`].
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// See [`ServiceOptions::prefix`].
    pub prefix: String,

    /// See [`ServiceOptions::name`].
    pub name: String,

    /// See [`ServiceOptions::queue_name`].
    pub queue_name: Option<String>,

    /// See [`ServiceOptions::publish_queue_size`].
    pub publish_queue_size: usize,

    /// See [`ServiceOptions::subscribe_queue_size`].
    pub subscribe_queue_size: usize,

    /// Telemetry period in milliseconds.
    pub telemetry_period_ms: u64,

    /// See [`ServiceOptions::verbose`].
    pub verbose: bool,

    /// Hex-encoded 32-byte signing key seed.
    pub signing_key: Option<String>,

    /// Hex-encoded public keys.
    pub known_identities: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let options = ServiceOptions::default();
        Self {
            prefix: options.prefix,
            name: options.name,
            queue_name: None,
            publish_queue_size: options.publish_queue_size,
            subscribe_queue_size: options.subscribe_queue_size,
            telemetry_period_ms: u64::try_from(options.telemetry_period.as_millis())
                .unwrap_or(u64::MAX),
            verbose: false,
            signing_key: None,
            known_identities: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    /// Returns an error if the document does not parse.
    pub fn from_toml(document: &str) -> Result<Self, Error> {
        toml::from_str(document).map_err(|e| Error::Config(e.to_string()))
    }

    /// Converts into validated options.
    ///
    /// # Errors
    /// Returns an error for a malformed signing key or invalid options.
    pub fn into_options(self) -> Result<ServiceOptions, Error> {
        let signing_key = self
            .signing_key
            .as_deref()
            .map(decode_signing_key)
            .transpose()?;

        let options = ServiceOptions {
            prefix: self.prefix,
            name: self.name,
            queue_name: self.queue_name.filter(|queue| !queue.is_empty()),
            publish_queue_size: self.publish_queue_size,
            subscribe_queue_size: self.subscribe_queue_size,
            telemetry_period: Duration::from_millis(self.telemetry_period_ms),
            verbose: self.verbose,
            signing_key,
            known_identities: HashMap::new(),
        }
        .with_known_identities(&self.known_identities);

        options.validate()?;
        Ok(options)
    }
}

fn decode_signing_key(seed: &str) -> Result<SigningKey, Error> {
    let bytes = hex::decode(seed).map_err(|e| Error::InvalidSigningKey(e.to_string()))?;
    let bytes: [u8; SECRET_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        Error::InvalidSigningKey(format!("expected {SECRET_KEY_LENGTH} bytes"))
    })?;
    Ok(SigningKey::from_bytes(&bytes))
}
