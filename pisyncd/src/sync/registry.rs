use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use pisync_core::Connector;
use tracing::info;

use super::connection::{ConnectionManager, ManagerOptions, ManagerSettings};
use crate::config::{ConfigError, SyncSettings};

#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credential {
    pub password: Option<String>,
    pub private_key_path: Option<PathBuf>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    pub remote_root: String,
    pub local_root: PathBuf,
}

impl SyncTarget {
    pub fn from_settings(settings: &SyncSettings) -> Result<Self, ConfigError> {
        if settings.host.trim().is_empty() {
            return Err(ConfigError::Missing("host"));
        }
        if settings.username.trim().is_empty() {
            return Err(ConfigError::Missing("username"));
        }
        if settings.remote_path.trim().is_empty() {
            return Err(ConfigError::Missing("remotePath"));
        }
        if settings.local_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("localPath"));
        }
        if settings.password.is_none() && settings.private_key_path.is_none() {
            return Err(ConfigError::NoCredential);
        }

        let remote_root = settings.remote_path.trim();
        let remote_root = if remote_root.len() > 1 {
            remote_root.trim_end_matches('/')
        } else {
            remote_root
        };
        Ok(Self {
            host: settings.host.trim().to_string(),
            port: settings.port,
            username: settings.username.trim().to_string(),
            credential: Credential {
                password: settings.password.clone(),
                private_key_path: settings.private_key_path.clone(),
            },
            remote_root: remote_root.to_string(),
            local_root: settings.local_path.clone(),
        })
    }

    /// `username@host:port:remoteRoot`; one connection manager per key.
    pub fn key(&self) -> String {
        format!(
            "{}@{}:{}:{}",
            self.username, self.host, self.port, self.remote_root
        )
    }
}

/// Connection managers keyed by target identity.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    options: ManagerOptions,
    managers: Mutex<HashMap<String, ConnectionManager>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_options(connector, ManagerOptions::default())
    }

    pub fn with_options(connector: Arc<dyn Connector>, options: ManagerOptions) -> Self {
        Self {
            connector,
            options,
            managers: Mutex::new(HashMap::new()),
        }
    }

    fn managers(&self) -> MutexGuard<'_, HashMap<String, ConnectionManager>> {
        match self.managers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the manager for `target`, creating it on first use. Settings
    /// of an existing manager are refreshed.
    pub fn get_or_create(&self, target: &SyncTarget, settings: &SyncSettings) -> ConnectionManager {
        let manager_settings = ManagerSettings {
            target: target.clone(),
            connect_timeout: settings.connect_timeout(),
            operation_timeout: settings.operation_timeout(),
        };
        let key = target.key();
        let mut managers = self.managers();
        if let Some(existing) = managers.get(&key) {
            existing.refresh_settings(manager_settings);
            return existing.clone();
        }
        info!("creating connection manager for {}", key);
        let manager = ConnectionManager::new(
            manager_settings,
            Arc::clone(&self.connector),
            self.options,
        );
        managers.insert(key, manager.clone());
        manager
    }

    pub fn get(&self, key: &str) -> Option<ConnectionManager> {
        self.managers().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.managers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers().is_empty()
    }

    pub async fn dispose(&self, key: &str) {
        let manager = self.managers().remove(key);
        if let Some(manager) = manager {
            manager.dispose().await;
        }
    }

    pub async fn dispose_all(&self) {
        let managers: Vec<ConnectionManager> =
            self.managers().drain().map(|(_, manager)| manager).collect();
        for manager in managers {
            manager.dispose().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pisync_core::memory::MemoryRemote;

    fn settings() -> SyncSettings {
        SyncSettings {
            host: "pi.local".into(),
            username: "pi".into(),
            password: Some("raspberry".into()),
            remote_path: "/srv/app/".into(),
            local_path: PathBuf::from("/tmp/app"),
            ..SyncSettings::default()
        }
    }

    #[test]
    fn target_key_identifies_remote_root() {
        let target = SyncTarget::from_settings(&settings()).unwrap();
        assert_eq!(target.key(), "pi@pi.local:22:/srv/app");
        assert_eq!(target.remote_root, "/srv/app");
    }

    #[test]
    fn target_requires_a_credential() {
        let mut settings = settings();
        settings.password = None;
        assert!(matches!(
            SyncTarget::from_settings(&settings),
            Err(ConfigError::NoCredential)
        ));
        settings.private_key_path = Some(PathBuf::from("/home/me/.ssh/id_ed25519"));
        assert!(SyncTarget::from_settings(&settings).is_ok());
    }

    #[test]
    fn target_requires_host() {
        let mut settings = settings();
        settings.host = " ".into();
        assert!(matches!(
            SyncTarget::from_settings(&settings),
            Err(ConfigError::Missing("host"))
        ));
    }

    #[test]
    fn credential_debug_is_redacted() {
        let target = SyncTarget::from_settings(&settings()).unwrap();
        assert!(!format!("{target:?}").contains("raspberry"));
    }

    #[tokio::test]
    async fn one_manager_per_target_key() {
        let registry = ConnectionRegistry::new(Arc::new(MemoryRemote::new()));
        let settings = settings();
        let target = SyncTarget::from_settings(&settings).unwrap();

        let first = registry.get_or_create(&target, &settings);
        let mut changed = settings.clone();
        changed.operation_timeout_ms = 1234;
        let second = registry.get_or_create(&target, &changed);
        assert_eq!(registry.len(), 1);
        assert_eq!(first.key(), second.key());
        assert_eq!(first.operation_timeout(), std::time::Duration::from_millis(1234));

        let mut other = settings.clone();
        other.remote_path = "/srv/other".into();
        let other_target = SyncTarget::from_settings(&other).unwrap();
        registry.get_or_create(&other_target, &other);
        assert_eq!(registry.len(), 2);

        registry.dispose(&target.key()).await;
        assert!(registry.get(&target.key()).is_none());
        registry.dispose_all().await;
        assert!(registry.is_empty());
    }
}
