use crate::profile::{Profile, ProfilePayload, ProfileUpdate, ProfileView, StatusUpdate};
use crate::store::{SealedFile, StoreError};
use secrecy::SecretString;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

const KEY_INFO: &[u8] = b"pg-stat-profiler-profiles-v1";

/// The authoritative registry of profiles.
///
/// Every mutation is computed on a copy, sealed to disk, and only then
/// swapped in, so memory and disk never disagree after a failed write.
pub struct ProfileStore {
    file: SealedFile,
    profiles: BTreeMap<String, Profile>,
}

impl ProfileStore {
    /// Open the registry at `path`, starting empty when the file is absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Load`] if the file exists but cannot be opened
    /// with `secret`.
    pub fn open(path: impl Into<PathBuf>, secret: &SecretString) -> Result<Self, StoreError> {
        let path = path.into();
        let file = SealedFile::new(&path, secret, KEY_INFO).map_err(|source| StoreError::Load {
            path: path.clone(),
            source,
        })?;

        let profiles: Vec<Profile> = file
            .load()
            .map_err(|source| StoreError::Load {
                path: path.clone(),
                source,
            })?
            .unwrap_or_default();

        info!(path = %path.display(), profiles = profiles.len(), "profile registry loaded");

        Ok(Self {
            file,
            profiles: profiles
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
        })
    }

    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`], [`StoreError::Invalid`] or
    /// [`StoreError::Persist`].
    pub fn create(&mut self, name: &str, payload: ProfilePayload) -> Result<ProfileView, StoreError> {
        if self.profiles.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }

        let profile = Profile::from_payload(name, payload)?;
        let view = profile.view();

        let mut next = self.profiles.clone();
        next.insert(name.to_string(), profile);
        self.commit(next)?;

        info!(profile = %name, "profile created");
        Ok(view)
    }

    /// # Errors
    ///
    /// [`StoreError::NotFound`].
    pub fn read(&self, name: &str) -> Result<ProfileView, StoreError> {
        self.get(name).map(Profile::view)
    }

    pub fn read_all(&self) -> Vec<ProfileView> {
        self.profiles.values().map(Profile::view).collect()
    }

    /// # Errors
    ///
    /// [`StoreError::NotFound`], [`StoreError::Invalid`] or
    /// [`StoreError::Persist`].
    pub fn update(&mut self, name: &str, update: ProfileUpdate) -> Result<ProfileView, StoreError> {
        let mut profile = self.get(name)?.clone();
        profile.apply(update)?;
        let view = profile.view();

        let mut next = self.profiles.clone();
        next.insert(name.to_string(), profile);
        self.commit(next)?;

        info!(profile = %name, "profile updated");
        Ok(view)
    }

    /// Status-only mutation used for statuses relayed from workers. Nothing
    /// is written when the statuses are unchanged. Returns whether they
    /// changed.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] or [`StoreError::Persist`].
    pub fn update_status(&mut self, name: &str, update: StatusUpdate) -> Result<bool, StoreError> {
        let mut profile = self.get(name)?.clone();

        if !profile.apply_status(update) {
            return Ok(false);
        }

        let mut next = self.profiles.clone();
        next.insert(name.to_string(), profile);
        self.commit(next)?;

        debug!(profile = %name, "profile statuses updated");
        Ok(true)
    }

    /// # Errors
    ///
    /// [`StoreError::NotFound`] or [`StoreError::Persist`].
    pub fn delete(&mut self, name: &str) -> Result<(), StoreError> {
        self.get(name)?;

        let mut next = self.profiles.clone();
        next.remove(name);
        self.commit(next)?;

        info!(profile = %name, "profile deleted");
        Ok(())
    }

    /// Decrypt query text captured for `name` with its current secret.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`], [`StoreError::EncryptionDisabled`] or
    /// [`StoreError::Decrypt`].
    pub fn decrypt_query(&self, name: &str, ciphertext: &str) -> Result<String, StoreError> {
        let cipher = self
            .get(name)?
            .cipher()?
            .ok_or_else(|| StoreError::EncryptionDisabled(name.to_string()))?;

        Ok(cipher.decrypt(ciphertext)?)
    }

    /// Full profiles, credentials included, for in-process consumers.
    pub fn profiles(&self) -> Vec<Profile> {
        self.profiles.values().cloned().collect()
    }

    fn get(&self, name: &str) -> Result<&Profile, StoreError> {
        self.profiles
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn commit(&mut self, next: BTreeMap<String, Profile>) -> Result<(), StoreError> {
        let persisted: Vec<&Profile> = next.values().collect();

        self.file
            .store(&persisted)
            .map_err(|source| StoreError::Persist {
                path: self.file.path().to_path_buf(),
                source,
            })?;

        self.profiles = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{MonitoredDbStatus, ReportDbStatus};
    use crate::profile::{ProfileStatus, QueryEncryption};
    use crate::store::SealError;

    fn secret() -> SecretString {
        SecretString::from("config-secret".to_string())
    }

    fn payload() -> ProfilePayload {
        serde_json::from_value(serde_json::json!({
            "status": "enabled",
            "monitored_connection": {
                "host": "prod-db", "dbname": "orders", "username": "profiler", "password": "m0n"
            },
            "report_connection": {
                "host": "report-db", "dbname": "reports", "username": "writer", "password": "r3p"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_create_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::open(dir.path().join("reg"), &secret()).unwrap();

        let created = store.create("p1", payload()).unwrap();
        let read = store.read("p1").unwrap();

        assert_eq!(created, read);
        assert_eq!(read.status, ProfileStatus::Enabled);
        assert_eq!(read.monitored_connection.host, "prod-db");
        assert_eq!(store.read_all().len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::open(dir.path().join("reg"), &secret()).unwrap();

        store.create("p1", payload()).unwrap();
        assert!(matches!(
            store.create("p1", payload()),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_missing_profile_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::open(dir.path().join("reg"), &secret()).unwrap();

        assert!(matches!(store.read("nope"), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.update("nope", ProfileUpdate::default()),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(store.delete("nope"), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.update_status("nope", StatusUpdate::default()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reg");

        {
            let mut store = ProfileStore::open(&path, &secret()).unwrap();
            store.create("p1", payload()).unwrap();
            store.create("p2", payload()).unwrap();
            store.delete("p2").unwrap();
            store
                .update_status(
                    "p1",
                    StatusUpdate {
                        monitor_db_status: Some(MonitoredDbStatus::Operational),
                        report_db_status: None,
                    },
                )
                .unwrap();
        }

        let store = ProfileStore::open(&path, &secret()).unwrap();
        let names: Vec<String> = store.read_all().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["p1"]);

        let p1 = store.read("p1").unwrap();
        assert_eq!(p1.monitor_db_status, MonitoredDbStatus::Operational);
        assert_eq!(p1.report_db_status, ReportDbStatus::Unknown);
    }

    #[test]
    fn test_wrong_config_secret_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reg");
        ProfileStore::open(&path, &secret())
            .unwrap()
            .create("p1", payload())
            .unwrap();

        let res = ProfileStore::open(&path, &SecretString::from("other".to_string()));
        assert!(matches!(
            res,
            Err(StoreError::Load {
                source: SealError::Decrypt,
                ..
            })
        ));
    }

    #[test]
    fn test_failed_persist_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reg");
        let mut store = ProfileStore::open(&path, &secret()).unwrap();
        store.create("p1", payload()).unwrap();

        std::fs::create_dir(dir.path().join("reg.tmp")).unwrap();

        assert!(matches!(
            store.create("p2", payload()),
            Err(StoreError::Persist { .. })
        ));
        assert!(matches!(store.read("p2"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete("p1"), Err(StoreError::Persist { .. })));
        assert!(store.read("p1").is_ok());
    }

    #[test]
    fn test_unchanged_status_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::open(dir.path().join("reg"), &secret()).unwrap();
        store.create("p1", payload()).unwrap();

        let update = StatusUpdate {
            monitor_db_status: Some(MonitoredDbStatus::Unreachable),
            report_db_status: Some(ReportDbStatus::Unreachable),
        };
        assert!(store.update_status("p1", update).unwrap());
        assert!(!store.update_status("p1", update).unwrap());
    }

    #[test]
    fn test_decrypt_query() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::open(dir.path().join("reg"), &secret()).unwrap();

        let mut p = payload();
        p.query_encryption = Some(QueryEncryption::Enabled);
        p.query_encryption_secret = Some("cXVlcnktc2VjcmV0".to_string());
        store.create("enc", p).unwrap();
        store.create("plain", payload()).unwrap();

        let cipher = store.get("enc").unwrap().cipher().unwrap().unwrap();
        let ciphertext = cipher.encrypt("select * from accounts").unwrap();

        assert_eq!(
            store.decrypt_query("enc", &ciphertext).unwrap(),
            "select * from accounts"
        );
        assert!(matches!(
            store.decrypt_query("plain", &ciphertext),
            Err(StoreError::EncryptionDisabled(_))
        ));
        assert!(matches!(
            store.decrypt_query("missing", &ciphertext),
            Err(StoreError::NotFound(_))
        ));

        store
            .update(
                "enc",
                ProfileUpdate {
                    query_encryption_secret: Some("b3RoZXItc2VjcmV0".to_string()),
                    ..ProfileUpdate::default()
                },
            )
            .unwrap();
        assert!(matches!(
            store.decrypt_query("enc", &ciphertext),
            Err(StoreError::Decrypt(_))
        ));
    }
}
