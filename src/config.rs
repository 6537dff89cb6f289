//! Uploader configuration
//!
//! Handles loading and saving the JSON configuration, including:
//! - Retry policy for each stage
//! - Frame size and pacing
//! - Expected characteristic names
//! - Discovery filter and window

use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::binder::CharacteristicNames;
use crate::error::{OtaError, Result};
use crate::protocol::checksum::ChecksumMode;
use crate::protocol::{DEFAULT_CHUNK_MTU, HEADER_LEN, MAX_PAYLOAD_SIZE};
use crate::retry::RetryPolicy;
use crate::transfer::{TransferEngine, TransferStrategy};

/// How long discovery listens before settling on the candidates it has.
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    pub pair: RetryPolicy,
    pub connect: RetryPolicy,
    pub send: RetryPolicy,

    /// Delay after each chunk write
    #[serde(rename = "chunk_delay_ms", with = "millis_opt")]
    pub chunk_delay: Option<Duration>,

    /// Payload bytes per frame, excluding the header
    pub mtu: usize,

    /// Largest write the link accepts, when known
    pub att_mtu: Option<usize>,

    pub characteristics: CharacteristicNames,
    pub checksum: ChecksumMode,
    pub strategy: TransferStrategy,

    #[serde(rename = "discovery_window_ms", with = "millis")]
    pub discovery_window: Duration,

    /// Only consider peripherals advertising exactly this name
    pub target_name: Option<String>,

    /// Read the status characteristic back after a successful transfer
    pub verify_read: bool,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            pair: RetryPolicy::default(),
            connect: RetryPolicy::default(),
            send: RetryPolicy::default(),
            chunk_delay: None,
            mtu: DEFAULT_CHUNK_MTU,
            att_mtu: None,
            characteristics: CharacteristicNames::default(),
            checksum: ChecksumMode::default(),
            strategy: TransferStrategy::default(),
            discovery_window: DEFAULT_DISCOVERY_WINDOW,
            target_name: None,
            verify_read: false,
        }
    }
}

impl OtaConfig {
    /// Load and validate configuration from a JSON file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from {:?}", path);
        let content = tokio::fs::read_to_string(path).await?;
        let config: OtaConfig = serde_json::from_str(&content)?;
        config.validate()?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        debug!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.mtu == 0 || self.mtu > MAX_PAYLOAD_SIZE {
            return Err(OtaError::InvalidMtu(self.mtu));
        }
        if let Some(att_mtu) = self.att_mtu {
            if self.mtu + HEADER_LEN > att_mtu {
                return Err(OtaError::Config(format!(
                    "{}-byte frames do not fit the {}-byte ATT MTU",
                    self.mtu + HEADER_LEN,
                    att_mtu
                )));
            }
        }
        if self.characteristics.write.is_empty() {
            return Err(OtaError::Config("write characteristic name is empty".into()));
        }
        Ok(())
    }

    pub fn transfer_engine(&self) -> TransferEngine {
        TransferEngine::new(self.mtu)
            .with_checksum(self.checksum)
            .with_pacing(self.chunk_delay)
    }
}

/// `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

pub(crate) mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
