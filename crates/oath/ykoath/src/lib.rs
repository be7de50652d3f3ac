//! YKOATH core for YubiKeys reached over ISO-DEP
//!
//! This crate talks to the OATH applet of a YubiKey through any
//! [`IsoDepTransport`](ykoath_apdu_core::IsoDepTransport), typically an NFC
//! reader.
//!
//! ## Overview
//!
//! - [`TagSession`] follows one physical tag and runs the operations
//!   submitted against it one at a time, selecting the applet as needed
//! - [`YubiKey`] keeps the state of one logical card: authorization, the
//!   credential list, codes and their TOTP validity
//! - [`YubiKeyCard`] is the consumer facade, re-targetable by card id
//! - [`OathContext`] owns the registries, the access key store and the
//!   operation id allocator, and takes tag presence from the NFC layer
//!
//! Everything runs on one thread. Operations are `spawn_local` tasks, so the
//! core must be driven from within a [`tokio::task::LocalSet`].
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod commands;
pub mod constants;
pub mod crypto;
pub mod keystore;

mod card;
mod config;
mod context;
mod error;
mod events;
mod operation;
mod session;
mod types;
mod yubikey;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use card::{CardEvent, YubiKeyCard};
pub use config::{OathConfig, default_config_dir};
pub use context::{ContextEvent, OathContext};
pub use error::{Error, Result};
pub use events::{ListenerId, Listeners};
pub use keystore::{KeyChanged, KeyStore};
pub use operation::OpState;
pub use session::{OperationIds, SessionEvent, TagLink, TagSession, Transmission};
pub use types::{
    Algorithm, AuthAccess, Code, OtpEntry, TagState, Token, TokenType, Version, YubiKeyState,
    card_name, truncate,
};
pub use yubikey::{YubiKey, YubiKeyEvent};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeOathCard;
    use hex_literal::hex;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tokio::task::LocalSet;

    const CARD_ID: [u8; 8] = hex!("0102030405060708");

    async fn settle() {
        for _ in 0..256 {
            tokio::task::yield_now().await;
        }
    }

    fn context(dir: &tempfile::TempDir) -> OathContext {
        OathContext::new(OathConfig::new().with_config_dir(dir.path()))
    }

    fn recognized(context: &OathContext) -> Rc<RefCell<Vec<ContextEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let e = events.clone();
        context.subscribe(move |event| e.borrow_mut().push(event.clone()));
        events
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_tag_to_codes() {
        LocalSet::new()
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let context = context(&dir);
                let events = recognized(&context);
                let fake = Rc::new(
                    FakeOathCard::new(&CARD_ID)
                        .with_token(&Token::totp("totp", b"12345678901234567890".to_vec()))
                        .with_token(&Token::hotp("hotp", b"12345678901234567890".to_vec()))
                        .with_chunk(16),
                );

                context.tag_arrived("reader0", TagLink::IsoDep(fake.clone()));
                settle().await;
                assert_eq!(
                    *events.borrow(),
                    vec![ContextEvent::TagRecognized {
                        path: "reader0".into(),
                        card_id: CARD_ID.to_vec(),
                    }]
                );

                let card = YubiKeyCard::new(&context);
                let card_events = card.events();
                card.set_yubikey_id(&CARD_ID);
                settle().await;

                assert!(card.present());
                assert_eq!(card.auth_access(), AuthAccess::Open);
                assert_eq!(card.yubikey_state(), YubiKeyState::Ready);
                assert_eq!(card.yubikey_version(), "5.4.3");
                assert!(card.otp_list_fetched());
                assert!(card.totp_valid());
                assert!(card.totp_time_left() > 0);
                assert_eq!(card.refreshable_tokens(), vec!["hotp".to_string()]);

                let entries = card.entries();
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].name, "totp");
                assert_eq!(entries[0].display_code().map(|c| c.len()), Some(6));
                assert_eq!(entries[1].code, Some(Code::NoResponse));

                // RFC 4226 counter 0
                let id = card.refresh_tokens(&["hotp".to_string()]).unwrap();
                assert!(card.valid_operation_id(id));
                settle().await;
                assert!(!card.valid_operation_id(id));
                let hotp = card.entries().into_iter().find(|e| e.name == "hotp").unwrap();
                assert_eq!(hotp.display_code().as_deref(), Some("755224"));

                drop(card_events);
                context.tag_gone("reader0");
                settle().await;
                assert!(!card.present());
                assert!(context.present_tags().is_empty());
                assert_eq!(
                    events.borrow().last(),
                    Some(&ContextEvent::TagGone { path: "reader0".into() })
                );
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_password_flow() {
        LocalSet::new()
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let context = context(&dir);
                let fake = Rc::new(
                    FakeOathCard::new(&CARD_ID)
                        .with_password(Algorithm::Sha1, "secret")
                        .with_token(&Token::totp("a", b"12345678901234567890".to_vec())),
                );
                context.tag_arrived("reader0", TagLink::IsoDep(fake.clone()));
                let card = YubiKeyCard::new(&context);
                card.set_yubikey_id(&CARD_ID);
                settle().await;

                // No key yet: denied without talking to the card
                assert_eq!(card.auth_access(), AuthAccess::Denied);
                assert_eq!(card.yubikey_state(), YubiKeyState::Unauthorized);
                assert!(!fake.instructions().contains(&constants::ins::VALIDATE));
                assert!(card.entries().is_empty());

                let rejected = Rc::new(RefCell::new(0));
                let r = rejected.clone();
                card.subscribe(move |event| {
                    if *event == CardEvent::AccessKeyNotAccepted {
                        *r.borrow_mut() += 1;
                    }
                });

                card.submit_password("wrong", false).unwrap();
                settle().await;
                assert_eq!(card.auth_access(), AuthAccess::Denied);
                assert!(*rejected.borrow() > 0);

                card.submit_password("secret", true).unwrap();
                settle().await;
                assert_eq!(card.auth_access(), AuthAccess::Granted);
                assert_eq!(card.yubikey_state(), YubiKeyState::Ready);
                assert_eq!(card.entries().len(), 1);
                assert!(context.keystore().auth_file(&CARD_ID).exists());

                // Removing the code clears the stored keys and opens the card
                card.set_password("").unwrap();
                settle().await;
                assert!(!fake.has_password());
                assert!(!context.keystore().auth_file(&CARD_ID).exists());
                assert_eq!(card.auth_access(), AuthAccess::Open);
                assert_eq!(card.entries().len(), 1);
            })
            .await;
    }
}
