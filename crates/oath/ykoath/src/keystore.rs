//! Access keys per card and algorithm
//!
//! Keys are cached in memory and optionally persisted to
//! `<config dir>/<hex card id>/auth`, a JSON object mapping algorithm names to
//! hex encoded keys.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{AccessKey, derive_key};
use crate::events::{ListenerId, Listeners};
use crate::{Algorithm, Result};

const AUTH_FILE: &str = "auth";

/// A cached key was added, replaced or removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChanged {
    /// Card the key belongs to
    pub card_id: Vec<u8>,
    /// Algorithm of the key
    pub algorithm: Algorithm,
}

type CardKeys = BTreeMap<Algorithm, AccessKey>;

/// Per-card access key cache backed by credential files
#[derive(Debug)]
pub struct KeyStore {
    dir: PathBuf,
    cards: RefCell<HashMap<Vec<u8>, CardKeys>>,
    listeners: Listeners<KeyChanged>,
}

impl KeyStore {
    /// Store keeping its files under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cards: RefCell::new(HashMap::new()),
            listeners: Listeners::new(),
        }
    }

    /// Configuration directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding the files of one card
    pub fn card_dir(&self, card_id: &[u8]) -> PathBuf {
        self.dir.join(hex::encode(card_id))
    }

    /// Credential file of one card
    pub fn auth_file(&self, card_id: &[u8]) -> PathBuf {
        self.card_dir(card_id).join(AUTH_FILE)
    }

    /// Cached key, loading the card's credential file on first use
    pub fn get(&self, card_id: &[u8], algorithm: Algorithm) -> Option<AccessKey> {
        self.load(card_id);
        self.cards
            .borrow()
            .get(card_id)
            .and_then(|keys| keys.get(&algorithm))
            .cloned()
    }

    /// Cache `key`, and persist it or remove the credential file
    ///
    /// Returns whether the cached key changed. Listeners are only notified
    /// of a change.
    pub fn set(
        &self,
        card_id: &[u8],
        algorithm: Algorithm,
        key: AccessKey,
        persist: bool,
    ) -> Result<bool> {
        self.load(card_id);
        let changed = {
            let mut cards = self.cards.borrow_mut();
            let keys = cards.entry(card_id.to_vec()).or_default();
            let changed = keys.get(&algorithm) != Some(&key);
            keys.insert(algorithm, key);
            changed
        };

        if persist {
            self.save(card_id)?;
        } else {
            remove_file(&self.auth_file(card_id))?;
        }

        if changed {
            debug!(card = %hex::encode(card_id), %algorithm, persist, "Access key changed");
            self.notify(card_id, algorithm);
        }
        Ok(changed)
    }

    /// Derive the key for `password` and [`set`](Self::set) it
    pub fn set_password(
        &self,
        card_id: &[u8],
        algorithm: Algorithm,
        password: &str,
        persist: bool,
    ) -> Result<bool> {
        let key = derive_key(card_id, algorithm, password);
        self.set(card_id, algorithm, key, persist)
    }

    /// Forget every key of a card and delete its credential file
    pub fn clear(&self, card_id: &[u8]) -> Result<()> {
        self.load(card_id);
        let removed: Vec<Algorithm> = self
            .cards
            .borrow_mut()
            .get_mut(card_id)
            .map(|keys| std::mem::take(keys).into_keys().collect())
            .unwrap_or_default();

        remove_file(&self.auth_file(card_id))?;
        for algorithm in removed {
            debug!(card = %hex::encode(card_id), %algorithm, "Access key cleared");
            self.notify(card_id, algorithm);
        }
        Ok(())
    }

    /// Remove everything stored for a card that no longer exists
    pub fn purge(&self, card_id: &[u8]) -> Result<()> {
        self.cards.borrow_mut().remove(card_id);
        let dir = self.card_dir(card_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(dir = %dir.display(), "Purged card directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Register a change listener
    pub fn subscribe(&self, callback: impl Fn(&KeyChanged) + 'static) -> ListenerId {
        self.listeners.add(callback)
    }

    /// Remove a change listener
    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn notify(&self, card_id: &[u8], algorithm: Algorithm) {
        self.listeners.emit(&KeyChanged {
            card_id: card_id.to_vec(),
            algorithm,
        });
    }

    fn load(&self, card_id: &[u8]) {
        if self.cards.borrow().contains_key(card_id) {
            return;
        }
        let path = self.auth_file(card_id);
        let keys = match fs::read_to_string(&path) {
            Ok(content) => parse_keys(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), "Failed to parse credential file: {}", e);
                CardKeys::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => CardKeys::new(),
            Err(e) => {
                warn!(path = %path.display(), "Failed to read credential file: {}", e);
                CardKeys::new()
            }
        };
        if !keys.is_empty() {
            debug!(card = %hex::encode(card_id), count = keys.len(), "Loaded access keys");
        }
        self.cards.borrow_mut().insert(card_id.to_vec(), keys);
    }

    fn save(&self, card_id: &[u8]) -> Result<()> {
        let mut encoded: BTreeMap<String, String> = self
            .cards
            .borrow()
            .get(card_id)
            .map(|keys| {
                keys.iter()
                    .map(|(alg, key)| (alg.to_string(), hex::encode(key.as_bytes())))
                    .collect()
            })
            .unwrap_or_default();
        let json = Zeroizing::new(serde_json::to_string_pretty(&encoded)?);
        encoded.values_mut().for_each(Zeroize::zeroize);

        let dir = self.card_dir(card_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(AUTH_FILE);
        fs::write(&path, json.as_bytes())?;
        debug!(path = %path.display(), "Saved access keys");
        Ok(())
    }
}

fn parse_keys(content: &str) -> Result<CardKeys> {
    let entries: BTreeMap<String, serde_json::Value> = serde_json::from_str(content)?;
    Ok(entries
        .into_iter()
        .filter_map(|(name, value)| {
            let algorithm = Algorithm::from_name(&name)?;
            let bytes = Zeroizing::new(hex::decode(value.as_str()?).ok()?);
            Some((algorithm, AccessKey::from_slice(&bytes)?))
        })
        .collect())
}

fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use std::rc::Rc;

    const CARD: [u8; 3] = hex!("AABBCC");

    fn recorder(store: &KeyStore) -> Rc<RefCell<Vec<KeyChanged>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let e = events.clone();
        store.subscribe(move |change| e.borrow_mut().push(change.clone()));
        events
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let events = recorder(&store);

        assert!(store.get(&CARD, Algorithm::Sha1).is_none());
        assert!(store.set_password(&CARD, Algorithm::Sha1, "pw", true).unwrap());
        assert_eq!(events.borrow().len(), 1);
        assert_eq!(events.borrow()[0].algorithm, Algorithm::Sha1);

        // Same key again: file rewritten, nobody notified
        assert!(!store.set_password(&CARD, Algorithm::Sha1, "pw", true).unwrap());
        assert_eq!(events.borrow().len(), 1);

        let path = dir.path().join("aabbcc").join("auth");
        let content = fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        let expected = hex::encode(derive_key(&CARD, Algorithm::Sha1, "pw").as_bytes());
        assert_eq!(json["SHA1"], expected.as_str());

        let reloaded = KeyStore::new(dir.path());
        assert_eq!(
            reloaded.get(&CARD, Algorithm::Sha1),
            Some(derive_key(&CARD, Algorithm::Sha1, "pw"))
        );
        assert!(reloaded.get(&CARD, Algorithm::Sha256).is_none());
    }

    #[test]
    fn test_set_without_persist_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        store.set_password(&CARD, Algorithm::Sha1, "pw", true).unwrap();
        assert!(store.auth_file(&CARD).exists());

        assert!(!store.set_password(&CARD, Algorithm::Sha1, "pw", false).unwrap());
        assert!(!store.auth_file(&CARD).exists());
        // Still cached
        assert!(store.get(&CARD, Algorithm::Sha1).is_some());
    }

    #[test]
    fn test_clear_notifies_per_removed_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        store.set_password(&CARD, Algorithm::Sha1, "a", true).unwrap();
        store.set_password(&CARD, Algorithm::Sha256, "b", true).unwrap();
        let events = recorder(&store);

        store.clear(&CARD).unwrap();
        let algorithms: Vec<_> = events.borrow().iter().map(|e| e.algorithm).collect();
        assert_eq!(algorithms, vec![Algorithm::Sha1, Algorithm::Sha256]);
        assert!(store.get(&CARD, Algorithm::Sha1).is_none());
        assert!(!store.auth_file(&CARD).exists());

        // Nothing left to remove
        store.clear(&CARD).unwrap();
        assert_eq!(events.borrow().len(), 2);
    }

    #[test]
    fn test_bad_entries_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        fs::create_dir_all(store.card_dir(&CARD)).unwrap();
        fs::write(
            store.auth_file(&CARD),
            r#"{"SHA1": "zz", "MD5": "00112233445566778899aabbccddeeff", "SHA256": "00112233445566778899aabbccddeeff"}"#,
        )
        .unwrap();

        assert!(store.get(&CARD, Algorithm::Sha1).is_none());
        assert_eq!(
            store.get(&CARD, Algorithm::Sha256),
            Some(AccessKey::new(hex!("00112233445566778899aabbccddeeff")))
        );
    }

    #[test]
    fn test_purge() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        store.set_password(&CARD, Algorithm::Sha1, "pw", true).unwrap();
        store.purge(&CARD).unwrap();
        assert!(!store.card_dir(&CARD).exists());
        assert!(store.get(&CARD, Algorithm::Sha1).is_none());
        store.purge(&CARD).unwrap();
    }
}
