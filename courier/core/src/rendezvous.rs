//! Rendezvous Adapter
//!
//! The transport publishes each conduit's local fabric address at startup
//! and resolves peer addresses per send through this interface. The
//! service behind it is an external collaborator; two implementations
//! ship with the crate:
//!
//! - [`InMemoryRendezvous`]: shared map for tests and single-process use
//! - [`FileRendezvous`]: one JSON record per (process, format key) under a
//!   directory, for processes on one host
//!
//! Every record is keyed by process name *and* address format, so
//! consumers always resolve with the key matching the format their
//! conduit speaks.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fabric::{AddressFormat, RawAddress};
use crate::message::ProcessName;

/// Errors from address publication and resolution.
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// No address is published for the peer under the requested format.
    #[error("no {format} address published for {name}")]
    Unknown {
        /// The peer that could not be resolved.
        name: ProcessName,
        /// The address format requested.
        format: AddressFormat,
    },
    /// The stored record could not be decoded.
    #[error("corrupt rendezvous record: {0}")]
    Corrupt(String),
    /// Underlying I/O failure.
    #[error("rendezvous I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Address publication and resolution service.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Publish `address` for `name` under the key of `format`.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError`] if the record cannot be stored.
    async fn publish(
        &self,
        name: ProcessName,
        format: AddressFormat,
        address: &RawAddress,
    ) -> Result<(), RendezvousError>;

    /// Resolve the address published for `name` under the key of `format`.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::Unknown`] if nothing is published.
    async fn resolve(
        &self,
        name: ProcessName,
        format: AddressFormat,
    ) -> Result<RawAddress, RendezvousError>;
}

/// Shared-map rendezvous for tests and single-process setups. Cloning
/// shares the underlying map.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRendezvous {
    entries: Arc<DashMap<(ProcessName, AddressFormat), RawAddress>>,
}

impl InMemoryRendezvous {
    /// Create an empty rendezvous map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every record published for `name`, as if the process left.
    pub fn forget(&self, name: ProcessName) {
        self.entries.retain(|(entry_name, _), _| *entry_name != name);
    }
}

#[async_trait]
impl Rendezvous for InMemoryRendezvous {
    async fn publish(
        &self,
        name: ProcessName,
        format: AddressFormat,
        address: &RawAddress,
    ) -> Result<(), RendezvousError> {
        self.entries.insert((name, format), address.clone());
        Ok(())
    }

    async fn resolve(
        &self,
        name: ProcessName,
        format: AddressFormat,
    ) -> Result<RawAddress, RendezvousError> {
        self.entries
            .get(&(name, format))
            .map(|entry| entry.value().clone())
            .ok_or(RendezvousError::Unknown { name, format })
    }
}

/// On-disk record for one published address.
#[derive(Debug, Serialize, Deserialize)]
struct AddressRecord {
    process: String,
    format: String,
    address: String,
}

/// Directory-backed rendezvous: one JSON file per (process, format key),
/// so processes on one host can exchange conduit addresses.
#[derive(Clone, Debug)]
pub struct FileRendezvous {
    dir: PathBuf,
}

impl FileRendezvous {
    /// Use `dir` as the record directory; created on first publish.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, name: ProcessName, format: AddressFormat) -> PathBuf {
        self.dir
            .join(format!("{name}-{}.json", format.rendezvous_key()))
    }
}

#[async_trait]
impl Rendezvous for FileRendezvous {
    async fn publish(
        &self,
        name: ProcessName,
        format: AddressFormat,
        address: &RawAddress,
    ) -> Result<(), RendezvousError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let record = AddressRecord {
            process: name.to_string(),
            format: format.rendezvous_key().to_string(),
            address: hex::encode(address.as_bytes()),
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| RendezvousError::Corrupt(e.to_string()))?;
        let path = self.record_path(name, format);
        // Write-then-rename so resolvers never observe a partial record.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(path = ?path, "address published");
        Ok(())
    }

    async fn resolve(
        &self,
        name: ProcessName,
        format: AddressFormat,
    ) -> Result<RawAddress, RendezvousError> {
        let path = self.record_path(name, format);
        let json = match tokio::fs::read(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RendezvousError::Unknown { name, format });
            }
            Err(e) => return Err(e.into()),
        };
        let record: AddressRecord = serde_json::from_slice(&json)
            .map_err(|e| RendezvousError::Corrupt(e.to_string()))?;
        let bytes =
            hex::decode(&record.address).map_err(|e| RendezvousError::Corrupt(e.to_string()))?;
        Ok(RawAddress::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_publish_resolve() {
        let rendezvous = InMemoryRendezvous::new();
        let name = ProcessName::new(1, 0);
        let addr = RawAddress::new(vec![1, 2, 3]);

        rendezvous
            .publish(name, AddressFormat::Local, &addr)
            .await
            .unwrap();
        let resolved = rendezvous.resolve(name, AddressFormat::Local).await.unwrap();
        assert_eq!(resolved, addr);

        // The same name under a different format key is a miss.
        assert!(matches!(
            rendezvous.resolve(name, AddressFormat::Inet4).await,
            Err(RendezvousError::Unknown { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_memory_forget() {
        let rendezvous = InMemoryRendezvous::new();
        let name = ProcessName::new(1, 0);
        rendezvous
            .publish(name, AddressFormat::Local, &RawAddress::new(vec![9]))
            .await
            .unwrap();
        rendezvous.forget(name);
        assert!(rendezvous.resolve(name, AddressFormat::Local).await.is_err());
    }

    #[tokio::test]
    async fn test_file_rendezvous_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let rendezvous = FileRendezvous::new(dir.path());
        let name = ProcessName::new(2, 5);
        let addr = RawAddress::new(vec![0xAA, 0xBB]);

        rendezvous
            .publish(name, AddressFormat::Inet4, &addr)
            .await
            .unwrap();
        let resolved = rendezvous.resolve(name, AddressFormat::Inet4).await.unwrap();
        assert_eq!(resolved, addr);
    }

    #[tokio::test]
    async fn test_file_rendezvous_unknown_peer() {
        let dir = tempfile::tempdir().unwrap();
        let rendezvous = FileRendezvous::new(dir.path());
        let result = rendezvous
            .resolve(ProcessName::new(9, 9), AddressFormat::Inet4)
            .await;
        assert!(matches!(result, Err(RendezvousError::Unknown { .. })));
    }

    #[tokio::test]
    async fn test_file_rendezvous_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let rendezvous = FileRendezvous::new(dir.path());
        let name = ProcessName::new(3, 3);
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(
            dir.path().join(format!(
                "{name}-{}.json",
                AddressFormat::Inet4.rendezvous_key()
            )),
            b"not json",
        )
        .await
        .unwrap();
        assert!(matches!(
            rendezvous.resolve(name, AddressFormat::Inet4).await,
            Err(RendezvousError::Corrupt(_))
        ));
    }
}
