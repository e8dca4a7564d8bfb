//! The device registry: which physical nodes this gateway is allowed to
//! talk to, and what we last learned about them.

use std::path::PathBuf;

use async_trait::async_trait;
use log::debug;
use mac_address::MacAddress;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::messages::{DeviceIdentity, DeviceRole, DeviceStatus};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry parse: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Fields a session may write back for its own identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityUpdate {
    pub role: Option<DeviceRole>,
    pub status: Option<DeviceStatus>,
}

impl IdentityUpdate {
    pub fn role(role: DeviceRole) -> Self {
        IdentityUpdate {
            role: Some(role),
            ..Default::default()
        }
    }

    pub fn status(status: DeviceStatus) -> Self {
        IdentityUpdate {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Keyed store of known identities. Updates go through per-key upsert so
/// independent sessions cannot lose each other's writes.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn load(&self) -> Result<Vec<DeviceIdentity>, RegistryError>;
    async fn upsert(&self, id: MacAddress, update: IdentityUpdate) -> Result<(), RegistryError>;
}

/// JSON-array file store. All writes are funneled through one mutex, so a
/// whole-file rewrite can never interleave with another.
pub struct FileRegistry {
    path: PathBuf,
    writer: Mutex<()>,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileRegistry {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    async fn read_entries(&self) -> Result<Vec<DeviceIdentity>, RegistryError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("registry file {:?} not found, starting empty", self.path);
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }
}

#[async_trait]
impl Registry for FileRegistry {
    async fn load(&self) -> Result<Vec<DeviceIdentity>, RegistryError> {
        self.read_entries().await
    }

    async fn upsert(&self, id: MacAddress, update: IdentityUpdate) -> Result<(), RegistryError> {
        let _guard = self.writer.lock().await;
        let mut entries = self.read_entries().await?;
        match entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                if let Some(role) = update.role {
                    entry.role = role;
                }
                if let Some(status) = update.status {
                    entry.status = status;
                }
            }
            None => entries.push(DeviceIdentity {
                id,
                name: format!("module-{}", hex::encode(&id.bytes()[3..])),
                role: update.role.unwrap_or_default(),
                status: update.status.unwrap_or_default(),
            }),
        }
        let contents = serde_json::to_string_pretty(&entries)?;
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }
}
