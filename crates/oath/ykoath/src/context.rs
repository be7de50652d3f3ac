//! Registry of sessions and cards
//!
//! [`OathContext`] owns everything shared between tags and cards: the key
//! store, the operation id allocator and weak get-or-create registries of
//! [`TagSession`]s by path and [`YubiKey`]s by card id. The NFC access layer
//! feeds tag presence into it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, info};

use crate::events::{ListenerId, Listeners};
use crate::keystore::KeyStore;
use crate::session::{OperationIds, SessionEvent, TagLink, TagSession};
use crate::yubikey::YubiKey;
use crate::{OathConfig, TagState};

/// Tag presence as seen by the context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    /// The OATH applet answered on `path`
    TagRecognized {
        /// Tag path
        path: String,
        /// Card id reported by the applet
        card_id: Vec<u8>,
    },
    /// The tag on `path` has no OATH applet
    TagUnrecognized {
        /// Tag path
        path: String,
    },
    /// The tag on `path` went away
    TagGone {
        /// Tag path
        path: String,
    },
}

struct PresentTag {
    path: String,
    session: Rc<TagSession>,
    listener: ListenerId,
}

pub(crate) struct Shared {
    pub(crate) config: OathConfig,
    pub(crate) keystore: KeyStore,
    ids: Rc<OperationIds>,
    sessions: RefCell<HashMap<String, Weak<TagSession>>>,
    // In arrival order, the first one is active
    present: RefCell<Vec<PresentTag>>,
    yubikeys: RefCell<HashMap<Vec<u8>, Weak<YubiKey>>>,
    listeners: Listeners<ContextEvent>,
}

impl Shared {
    /// Session of the first present tag
    pub(crate) fn active_session(&self) -> Option<Rc<TagSession>> {
        self.present.borrow().first().map(|tag| tag.session.clone())
    }

    fn on_session_event(&self, path: &str, event: SessionEvent) {
        let Some(session) = self.sessions.borrow().get(path).and_then(Weak::upgrade) else {
            return;
        };
        match event {
            // A reset changes the id of a ready tag
            SessionEvent::StateChanged | SessionEvent::IdChanged => match session.state() {
                TagState::Ready if !session.card_id().is_empty() => {
                    let card_id = session.card_id();
                    info!(path, card = %hex::encode(&card_id), "YubiKey recognized");
                    self.listeners.emit(&ContextEvent::TagRecognized {
                        path: path.to_owned(),
                        card_id,
                    });
                }
                TagState::Unrecognized if event == SessionEvent::StateChanged => {
                    info!(path, "Tag not recognized");
                    self.listeners.emit(&ContextEvent::TagUnrecognized {
                        path: path.to_owned(),
                    });
                }
                _ => {}
            },
            _ => {}
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for tag in self.present.get_mut().drain(..) {
            tag.session.unsubscribe(tag.listener);
            tag.session.update_tag(None);
        }
    }
}

/// Entry point of the OATH core
///
/// Cheap to clone, every clone refers to the same registries.
#[derive(Clone)]
pub struct OathContext(Rc<Shared>);

impl fmt::Debug for OathContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OathContext")
            .field("config", &self.0.config)
            .field("present", &self.present_tags())
            .finish_non_exhaustive()
    }
}

impl OathContext {
    /// Context keeping access keys under the configured directory
    pub fn new(config: OathConfig) -> Self {
        let keystore = KeyStore::new(config.config_dir.clone());
        Self(Rc::new(Shared {
            config,
            keystore,
            ids: Rc::new(OperationIds::new()),
            sessions: RefCell::new(HashMap::new()),
            present: RefCell::new(Vec::new()),
            yubikeys: RefCell::new(HashMap::new()),
            listeners: Listeners::new(),
        }))
    }

    /// Configuration
    pub fn config(&self) -> &OathConfig {
        &self.0.config
    }

    /// Access key store
    pub fn keystore(&self) -> &KeyStore {
        &self.0.keystore
    }

    /// Session of the tag at `path`, created if nobody holds one
    pub fn session(&self, path: &str) -> Rc<TagSession> {
        let mut sessions = self.0.sessions.borrow_mut();
        if let Some(session) = sessions.get(path).and_then(Weak::upgrade) {
            return session;
        }
        sessions.retain(|_, session| session.strong_count() > 0);
        let session = TagSession::new(path, self.0.ids.clone(), self.0.config.processor());
        sessions.insert(path.to_owned(), Rc::downgrade(&session));
        session
    }

    /// Card with id `card_id`, created if nobody holds one
    pub fn yubikey(&self, card_id: &[u8]) -> Rc<YubiKey> {
        let existing = self
            .0
            .yubikeys
            .borrow()
            .get(card_id)
            .and_then(Weak::upgrade);
        if let Some(key) = existing {
            return key;
        }
        // Not holding the registry, the new card binds right away
        let key = YubiKey::new(card_id.to_vec(), self.0.clone());
        let mut yubikeys = self.0.yubikeys.borrow_mut();
        yubikeys.retain(|_, key| key.strong_count() > 0);
        yubikeys.insert(card_id.to_vec(), Rc::downgrade(&key));
        key
    }

    /// A tag appeared on `path`
    pub fn tag_arrived(&self, path: &str, link: TagLink) {
        let session = self.session(path);
        let known = self.0.present.borrow().iter().any(|tag| tag.path == path);
        if !known {
            debug!(path, ?link, "Tag arrived");
            let shared = Rc::downgrade(&self.0);
            let owned = path.to_owned();
            let listener = session.subscribe(move |event| {
                if let Some(shared) = shared.upgrade() {
                    shared.on_session_event(&owned, *event);
                }
            });
            self.0.present.borrow_mut().push(PresentTag {
                path: path.to_owned(),
                session: session.clone(),
                listener,
            });
        }
        session.update_tag(Some(link));
        self.rebind();
    }

    /// The tag on `path` went away
    pub fn tag_gone(&self, path: &str) {
        let removed = {
            let mut present = self.0.present.borrow_mut();
            present
                .iter()
                .position(|tag| tag.path == path)
                .map(|pos| present.remove(pos))
        };
        let Some(tag) = removed else {
            return;
        };
        debug!(path, "Tag gone");
        tag.session.unsubscribe(tag.listener);
        tag.session.update_tag(None);
        self.0.listeners.emit(&ContextEvent::TagGone {
            path: path.to_owned(),
        });
        self.rebind();
    }

    /// Paths of present tags, the active one first
    pub fn present_tags(&self) -> Vec<String> {
        self.0
            .present
            .borrow()
            .iter()
            .map(|tag| tag.path.clone())
            .collect()
    }

    /// Register a listener
    pub fn subscribe(&self, callback: impl Fn(&ContextEvent) + 'static) -> ListenerId {
        self.0.listeners.add(callback)
    }

    /// Remove a listener
    pub fn unsubscribe(&self, id: ListenerId) {
        self.0.listeners.remove(id);
    }

    fn rebind(&self) {
        let keys: Vec<Rc<YubiKey>> = self
            .0
            .yubikeys
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for key in keys {
            key.update_path();
        }
    }
}
