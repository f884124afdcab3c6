//! Environment parameters: signing keys, issuer identity and registered series codes
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ChainError;
use crate::signer::{DocumentSigner, RsaSigner};

#[derive(Debug, Clone, Deserialize)]
pub struct KeyEntry {
    pub version: u32,
    #[serde(default)]
    pub pem: Option<String>,
    #[serde(default)]
    pub pem_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub active_version: u32,
    #[serde(default)]
    pub keys: Vec<KeyEntry>,
    pub issuer_tax_id: String,
    #[serde(default = "default_certification_number")]
    pub certification_number: String,
    #[serde(default = "default_tax_region")]
    pub tax_region: String,
    #[serde(default = "default_canonical_currency")]
    pub canonical_currency: String,
    #[serde(default)]
    pub series_codes: HashMap<String, String>,
    /// Longest a single signature may take. Checked when the signer returns,
    /// so a signer that never returns is not interrupted.
    #[serde(default = "default_signing_deadline_ms")]
    pub signing_deadline_ms: u64,
    #[serde(default = "default_lease_wait_ms")]
    pub lease_wait_ms: u64,
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    #[serde(default = "default_integrity_batch_size")]
    pub integrity_batch_size: usize,
}

fn default_certification_number() -> String {
    "0".to_string()
}

fn default_tax_region() -> String {
    "PT".to_string()
}

fn default_canonical_currency() -> String {
    "EUR".to_string()
}

fn default_signing_deadline_ms() -> u64 {
    5_000
}

fn default_lease_wait_ms() -> u64 {
    10_000
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}

fn default_integrity_batch_size() -> usize {
    1_000
}

impl ChainConfig {
    /// Reads a TOML file, overlaid by `DOCCHAIN__*` environment variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()).format(FileFormat::Toml))
            .add_source(Environment::with_prefix("DOCCHAIN").separator("__"))
            .build()?;

        Ok(settings.try_deserialize::<ChainConfig>()?)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ChainError> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;

        Ok(settings.try_deserialize::<ChainConfig>()?)
    }
}

enum KeySlot {
    Ready(Arc<dyn DocumentSigner>),
    Unavailable(String),
}

/// Read-only view over the configuration and the signer of every version.
pub struct KeyConfigProvider {
    config: ChainConfig,
    keys: BTreeMap<u32, KeySlot>,
    signatures: AtomicU64,
}

impl KeyConfigProvider {
    /// Unreadable keys are kept as unavailable slots so failures surface at signing time.
    pub fn from_config(config: ChainConfig) -> Self {
        let mut keys = BTreeMap::new();

        for entry in &config.keys {
            let slot = match load_pem(entry).and_then(|pem| RsaSigner::from_pem(entry.version, &pem)) {
                Ok(signer) => {
                    info!(
                        version = entry.version,
                        fingerprint = signer.fingerprint().unwrap_or_default(),
                        "loaded signing key"
                    );
                    KeySlot::Ready(Arc::new(signer))
                }
                Err(err) => {
                    warn!(version = entry.version, error = %err, "signing key unavailable");
                    KeySlot::Unavailable(err.to_string())
                }
            };
            keys.insert(entry.version, slot);
        }

        Self {
            config,
            keys,
            signatures: AtomicU64::new(0),
        }
    }

    /// Installs a signer for its version, replacing any configured key.
    pub fn with_signer(mut self, signer: Arc<dyn DocumentSigner>) -> Self {
        self.keys.insert(signer.version(), KeySlot::Ready(signer));
        self
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn active_version(&self) -> u32 {
        self.config.active_version
    }

    pub fn has_version(&self, version: u32) -> bool {
        self.keys.contains_key(&version)
    }

    pub fn signer(&self, version: u32) -> Result<&Arc<dyn DocumentSigner>, ChainError> {
        match self.keys.get(&version) {
            Some(KeySlot::Ready(signer)) => Ok(signer),
            Some(KeySlot::Unavailable(reason)) => Err(ChainError::SigningUnavailable(reason.clone())),
            None => Err(ChainError::SigningUnavailable(format!(
                "no signing key configured for version {version}"
            ))),
        }
    }

    pub fn sign_active(&self, canonical: &[u8]) -> Result<String, ChainError> {
        self.sign_with(self.active_version(), canonical)
    }

    pub fn sign_with(&self, version: u32, canonical: &[u8]) -> Result<String, ChainError> {
        let hash = self.signer(version)?.sign(canonical)?;
        self.signatures.fetch_add(1, Ordering::Relaxed);
        Ok(hash)
    }

    /// Number of signatures produced since the provider was built.
    pub fn signatures_issued(&self) -> u64 {
        self.signatures.load(Ordering::Relaxed)
    }

    pub fn fingerprint(&self, version: u32) -> Option<String> {
        match self.keys.get(&version) {
            Some(KeySlot::Ready(signer)) => signer.fingerprint().map(str::to_owned),
            _ => None,
        }
    }

    pub fn issuer_tax_id(&self) -> &str {
        &self.config.issuer_tax_id
    }

    pub fn certification_number(&self) -> &str {
        &self.config.certification_number
    }

    pub fn tax_region(&self) -> &str {
        &self.config.tax_region
    }

    pub fn canonical_currency(&self) -> &str {
        &self.config.canonical_currency
    }

    pub fn series_code(&self, series_prefix: &str) -> Result<&str, ChainError> {
        self.config
            .series_codes
            .get(series_prefix)
            .map(String::as_str)
            .ok_or_else(|| ChainError::SeriesNotRegistered(series_prefix.to_owned()))
    }

    pub fn signing_deadline(&self) -> Duration {
        Duration::from_millis(self.config.signing_deadline_ms)
    }

    pub fn lease_wait(&self) -> Duration {
        Duration::from_millis(self.config.lease_wait_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.config.lease_ttl_ms)
    }

    pub fn integrity_batch_size(&self) -> usize {
        self.config.integrity_batch_size.max(1)
    }
}

fn load_pem(entry: &KeyEntry) -> Result<String, ChainError> {
    match (&entry.pem, &entry.pem_path) {
        (Some(pem), _) => Ok(pem.clone()),
        (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
            ChainError::SigningUnavailable(format!("cannot read {}: {e}", path.display()))
        }),
        (None, None) => Err(ChainError::Config(format!(
            "key version {} has neither pem nor pem_path",
            entry.version
        ))),
    }
}
