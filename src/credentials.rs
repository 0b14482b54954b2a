//! Account credentials and privileges.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Mutex,
};

/// SRP salt and verifier of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub salt: Vec<u8>,
    pub verifier: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access credential file: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential file is corrupt: {0}")]
    Corrupt(#[from] bincode::Error),
}

/// Where accounts live. Implementations must be usable from many tasks.
pub trait CredentialStore: Send + Sync + 'static {
    fn read_credential(&self, name: &str) -> Result<Option<Credential>, StoreError>;
    fn write_credential(&self, name: &str, credential: Credential) -> Result<(), StoreError>;
    fn read_privileges(&self, name: &str) -> Result<BTreeSet<String>, StoreError>;
    fn write_privileges(&self, name: &str, privileges: BTreeSet<String>)
        -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Accounts {
    credentials: BTreeMap<String, Credential>,
    privileges: BTreeMap<String, BTreeSet<String>>,
}

/// Keeps accounts in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: Mutex<Accounts>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn accounts(&self) -> std::sync::MutexGuard<'_, Accounts> {
        self.accounts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CredentialStore for MemoryStore {
    fn read_credential(&self, name: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self.accounts().credentials.get(name).cloned())
    }

    fn write_credential(&self, name: &str, credential: Credential) -> Result<(), StoreError> {
        self.accounts()
            .credentials
            .insert(name.to_owned(), credential);
        Ok(())
    }

    fn read_privileges(&self, name: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .accounts()
            .privileges
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    fn write_privileges(
        &self,
        name: &str,
        privileges: BTreeSet<String>,
    ) -> Result<(), StoreError> {
        self.accounts()
            .privileges
            .insert(name.to_owned(), privileges);
        Ok(())
    }
}

/// Keeps accounts in memory and rewrites a `bincode` snapshot after every
/// change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    accounts: Mutex<Accounts>,
}

impl FileStore {
    /// Opens the snapshot at `path`, starting empty if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_owned();
        let accounts = match fs_err::read(&path) {
            Ok(bytes) => bincode::deserialize(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Accounts::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            accounts: Mutex::new(accounts),
        })
    }

    /// Applies `f` to a copy and keeps it only once the snapshot is on disk.
    fn update(&self, f: impl FnOnce(&mut Accounts)) -> Result<(), StoreError> {
        let mut accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = accounts.clone();
        f(&mut next);
        let bytes = bincode::serialize(&next)?;

        let tmp = self.path.with_extension("tmp");
        fs_err::write(&tmp, bytes)?;
        fs_err::rename(&tmp, &self.path)?;
        *accounts = next;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Accounts) -> T) -> T {
        f(&self.accounts.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl CredentialStore for FileStore {
    fn read_credential(&self, name: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self.read(|a| a.credentials.get(name).cloned()))
    }

    fn write_credential(&self, name: &str, credential: Credential) -> Result<(), StoreError> {
        self.update(|a| {
            a.credentials.insert(name.to_owned(), credential);
        })
    }

    fn read_privileges(&self, name: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.read(|a| a.privileges.get(name).cloned().unwrap_or_default()))
    }

    fn write_privileges(
        &self,
        name: &str,
        privileges: BTreeSet<String>,
    ) -> Result<(), StoreError> {
        self.update(|a| {
            a.privileges.insert(name.to_owned(), privileges);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "mt-multiproxy-{tag}-{}-{}.bin",
            std::process::id(),
            rand::random::<u64>()
        ))
    }

    fn credential(byte: u8) -> Credential {
        Credential {
            salt: vec![byte; 16],
            verifier: vec![byte; 4],
        }
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.read_credential("sam").unwrap(), None);
        store.write_credential("sam", credential(1)).unwrap();
        assert_eq!(store.read_credential("sam").unwrap(), Some(credential(1)));

        assert!(store.read_privileges("sam").unwrap().is_empty());
        store
            .write_privileges("sam", BTreeSet::from(["shout".to_owned()]))
            .unwrap();
        assert!(store.read_privileges("sam").unwrap().contains("shout"));
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let path = temp_path("persist");
        {
            let store = FileStore::open(&path).unwrap();
            store.write_credential("sam", credential(2)).unwrap();
            store
                .write_privileges("sam", BTreeSet::from(["admin".to_owned()]))
                .unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.read_credential("sam").unwrap(), Some(credential(2)));
        assert!(store.read_privileges("sam").unwrap().contains("admin"));
        fs_err::remove_file(&path).unwrap();
    }

    #[test]
    fn failed_persist_leaves_the_store_unchanged() {
        let path = temp_path("missing-dir").join("accounts.bin");
        let store = FileStore::open(&path).unwrap();

        assert!(matches!(
            store.write_credential("sam", credential(3)),
            Err(StoreError::Io(_))
        ));
        assert_eq!(store.read_credential("sam").unwrap(), None);
        assert!(store
            .write_privileges("sam", BTreeSet::from(["admin".to_owned()]))
            .is_err());
        assert!(store.read_privileges("sam").unwrap().is_empty());
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let path = temp_path("corrupt");
        fs_err::write(&path, [0xff; 3]).unwrap();
        assert!(matches!(FileStore::open(&path), Err(StoreError::Corrupt(_))));
        fs_err::remove_file(&path).unwrap();
    }
}
