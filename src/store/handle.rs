//! Single-writer actor around [`ProfileStore`].
//!
//! The store lives on its own thread; everything else talks to it through a
//! cloneable [`StoreHandle`]. Commands are served one at a time, so file
//! writes are never concurrent.

use crate::profile::{Profile, ProfilePayload, ProfileUpdate, ProfileView, StatusUpdate};
use crate::store::{ProfileStore, StoreError};
use anyhow::{Context, Result};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

const COMMAND_QUEUE: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

enum Command {
    Create {
        name: String,
        payload: ProfilePayload,
        reply: Reply<ProfileView>,
    },
    Read {
        name: String,
        reply: Reply<ProfileView>,
    },
    ReadAll {
        reply: Reply<Vec<ProfileView>>,
    },
    Update {
        name: String,
        update: ProfileUpdate,
        reply: Reply<ProfileView>,
    },
    UpdateStatus {
        name: String,
        update: StatusUpdate,
        reply: Reply<bool>,
    },
    Delete {
        name: String,
        reply: Reply<()>,
    },
    DecryptQuery {
        name: String,
        ciphertext: String,
        reply: Reply<String>,
    },
    Profiles {
        reply: Reply<Vec<Profile>>,
    },
}

#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<Command>,
}

/// Move `store` onto its own thread. The thread exits once every handle has
/// been dropped.
///
/// # Errors
///
/// Returns an error if the thread cannot be spawned.
pub fn spawn(store: ProfileStore) -> Result<(StoreHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);

    let thread = thread::Builder::new()
        .name("profile-store".to_string())
        .spawn(move || serve(store, rx))
        .context("Failed to spawn profile store thread")?;

    Ok((StoreHandle { tx }, thread))
}

fn serve(mut store: ProfileStore, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.blocking_recv() {
        // a dropped reply receiver only means the caller went away
        match command {
            Command::Create {
                name,
                payload,
                reply,
            } => {
                let _ = reply.send(store.create(&name, payload));
            }
            Command::Read { name, reply } => {
                let _ = reply.send(store.read(&name));
            }
            Command::ReadAll { reply } => {
                let _ = reply.send(Ok(store.read_all()));
            }
            Command::Update {
                name,
                update,
                reply,
            } => {
                let _ = reply.send(store.update(&name, update));
            }
            Command::UpdateStatus {
                name,
                update,
                reply,
            } => {
                let _ = reply.send(store.update_status(&name, update));
            }
            Command::Delete { name, reply } => {
                let _ = reply.send(store.delete(&name));
            }
            Command::DecryptQuery {
                name,
                ciphertext,
                reply,
            } => {
                let _ = reply.send(store.decrypt_query(&name, &ciphertext));
            }
            Command::Profiles { reply } => {
                let _ = reply.send(Ok(store.profiles()));
            }
        }
    }

    debug!("profile store stopped");
}

impl StoreHandle {
    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(command(reply))
            .await
            .map_err(|_| StoreError::Unavailable)?;

        rx.await.map_err(|_| StoreError::Unavailable)?
    }

    /// # Errors
    ///
    /// See [`ProfileStore::create`].
    pub async fn create(&self, name: &str, payload: ProfilePayload) -> Result<ProfileView, StoreError> {
        let name = name.to_string();
        self.call(|reply| Command::Create {
            name,
            payload,
            reply,
        })
        .await
    }

    /// # Errors
    ///
    /// See [`ProfileStore::read`].
    pub async fn read(&self, name: &str) -> Result<ProfileView, StoreError> {
        let name = name.to_string();
        self.call(|reply| Command::Read { name, reply }).await
    }

    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the store thread is gone.
    pub async fn read_all(&self) -> Result<Vec<ProfileView>, StoreError> {
        self.call(|reply| Command::ReadAll { reply }).await
    }

    /// # Errors
    ///
    /// See [`ProfileStore::update`].
    pub async fn update(&self, name: &str, update: ProfileUpdate) -> Result<ProfileView, StoreError> {
        let name = name.to_string();
        self.call(|reply| Command::Update {
            name,
            update,
            reply,
        })
        .await
    }

    /// # Errors
    ///
    /// See [`ProfileStore::update_status`].
    pub async fn update_status(&self, name: &str, update: StatusUpdate) -> Result<bool, StoreError> {
        let name = name.to_string();
        self.call(|reply| Command::UpdateStatus {
            name,
            update,
            reply,
        })
        .await
    }

    /// # Errors
    ///
    /// See [`ProfileStore::delete`].
    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let name = name.to_string();
        self.call(|reply| Command::Delete { name, reply }).await
    }

    /// # Errors
    ///
    /// See [`ProfileStore::decrypt_query`].
    pub async fn decrypt_query(&self, name: &str, ciphertext: &str) -> Result<String, StoreError> {
        let name = name.to_string();
        let ciphertext = ciphertext.to_string();
        self.call(|reply| Command::DecryptQuery {
            name,
            ciphertext,
            reply,
        })
        .await
    }

    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the store thread is gone.
    pub async fn profiles(&self) -> Result<Vec<Profile>, StoreError> {
        self.call(|reply| Command::Profiles { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[tokio::test]
    async fn test_handle_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ProfileStore::open(
            dir.path().join("reg"),
            &SecretString::from("config".to_string()),
        )?;
        let (handle, thread) = spawn(store)?;

        let payload: ProfilePayload = serde_json::from_value(serde_json::json!({
            "monitored_connection": { "host": "a", "dbname": "b", "username": "c" },
            "report_connection": { "host": "d", "dbname": "e", "username": "f" }
        }))?;

        handle.create("p1", payload).await?;
        assert_eq!(handle.read("p1").await?.name, "p1");
        assert_eq!(handle.profiles().await?.len(), 1);
        assert!(matches!(
            handle.read("p2").await,
            Err(StoreError::NotFound(_))
        ));

        drop(handle);
        tokio::task::spawn_blocking(move || thread.join())
            .await?
            .map_err(|_| anyhow::anyhow!("store thread panicked"))?;

        Ok(())
    }
}
