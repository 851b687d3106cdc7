use std::{path::PathBuf, sync::Arc};

use color_eyre::{eyre::eyre, Result};
use conflux_storage::{
    audit_file::FileAuditLog,
    file_store::FileBlobStore,
    key_provider::{InMemoryKeyProvider, KeyProvider, KeyringProvider},
};
use dirs::data_dir;
use tracing::{debug, warn};

use crate::{
    config::{Config, KeyProviderKind},
    service::ConfigService,
};

const AUDIT_FILE: &str = "audit.jsonl";

/// Resolve the default data directory for the daemon.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| eyre!("no data dir available"))?;
    Ok(base.join("conflux"))
}

/// Data directory from config, falling back to the platform default.
pub fn data_root(config: &Config) -> Result<PathBuf> {
    match &config.data_dir {
        Some(root) => Ok(root.clone()),
        None => default_data_dir(),
    }
}

/// Master key source selected by config.
pub fn key_provider(config: &Config) -> Arc<dyn KeyProvider> {
    match config.keys.provider {
        KeyProviderKind::Keyring => Arc::new(KeyringProvider::new(
            config.keys.service.clone(),
            config.keys.account.clone(),
        )),
        KeyProviderKind::Memory => {
            warn!("using in-memory master keys; sealed data will be unreadable after restart");
            Arc::new(InMemoryKeyProvider::default())
        }
    }
}

/// Open the service over the file-backed stores under the data directory.
pub async fn open_service(config: &Config) -> Result<ConfigService> {
    let root = data_root(config)?;
    debug!(?root, "opening data directory");
    std::fs::create_dir_all(&root)?;
    open_service_at(config, root, key_provider(config)).await
}

/// Like [`open_service`] with an explicit root and key provider.
pub async fn open_service_at(
    config: &Config,
    root: PathBuf,
    keys: Arc<dyn KeyProvider>,
) -> Result<ConfigService> {
    let options = config.service_options()?;
    let blobs = Arc::new(FileBlobStore::new(root.join("blobs")));
    let audit = Arc::new(
        FileAuditLog::open(root.join(AUDIT_FILE))
            .await
            .map_err(|err| eyre!(err.to_string()))?,
    );
    ConfigService::open(options, blobs, audit, keys)
        .await
        .map_err(|err| eyre!(err.to_string()))
}

#[cfg(test)]
mod tests {
    use conflux_core::model::{EntryKey, Principal, VersionSelector};

    use super::*;
    use crate::service::PutRequest;

    #[tokio::test]
    async fn reopens_with_durable_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            bootstrap_admin: Some("admin".into()),
            ..Config::default()
        };
        let keys: Arc<dyn KeyProvider> = Arc::new(InMemoryKeyProvider::default());
        let admin = Principal::new("admin").unwrap();
        let entry = EntryKey::parse("prod", "db/password").unwrap();

        let service = open_service_at(&config, dir.path().to_path_buf(), Arc::clone(&keys))
            .await
            .expect("open");
        service
            .put(&admin, &entry, PutRequest::secret("s3cr3t"))
            .await
            .unwrap();
        drop(service);

        let reopened = open_service_at(&config, dir.path().to_path_buf(), keys)
            .await
            .expect("reopen");
        let read = reopened
            .get(&admin, &entry, VersionSelector::Latest)
            .await
            .unwrap();
        assert_eq!(read.data.as_slice(), b"s3cr3t");
        // One bootstrap policy, not two.
        assert_eq!(reopened.list_policies(&admin).await.unwrap().len(), 1);
        assert!(dir.path().join(AUDIT_FILE).exists());
    }
}
