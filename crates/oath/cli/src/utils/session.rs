//! Session management for the YKOATH CLI

use std::rc::Rc;
use std::time::Duration;

use eyre::{Result, bail, eyre};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use ykoath::{AuthAccess, CardEvent, ContextEvent, OathContext, TagLink, YubiKeyCard};
use ykoath_apdu_transport_pcsc::PcscDeviceManager;

use super::PasswordArgs;

/// How long a single step may take before giving up
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// A card recognized on a reader, seen through its facade
pub struct Connection {
    context: OathContext,
    path: Option<String>,
    card: Rc<YubiKeyCard>,
    events: mpsc::UnboundedReceiver<CardEvent>,
}

impl Connection {
    /// Open the tag on `reader` and wait for the OATH applet to answer
    pub async fn open(
        manager: &PcscDeviceManager,
        context: &OathContext,
        reader: &str,
    ) -> Result<Self> {
        let tag = manager.open_tag(reader)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = context.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        context.tag_arrived(reader, TagLink::IsoDep(Rc::new(tag)));

        let recognized = async {
            while let Some(event) = rx.recv().await {
                match event {
                    ContextEvent::TagRecognized { path, card_id } if path == reader => {
                        return Ok(card_id);
                    }
                    ContextEvent::TagUnrecognized { path } if path == reader => {
                        bail!("No OATH applet on the tag in {reader}")
                    }
                    ContextEvent::TagGone { path } if path == reader => {
                        bail!("Tag left {reader}")
                    }
                    _ => {}
                }
            }
            Err(eyre!("Context dropped"))
        };
        let card_id = timeout(STEP_TIMEOUT, recognized)
            .await
            .map_err(|_| eyre!("Timed out selecting the OATH applet"))
            .and_then(|result| result);
        context.unsubscribe(listener);

        let mut connection = Self::bind(context, &card_id?);
        connection.path = Some(reader.to_owned());
        Ok(connection)
    }

    /// Facade on a card the context already knows
    pub fn bind(context: &OathContext, card_id: &[u8]) -> Self {
        let card = YubiKeyCard::new(context);
        let events = card.events();
        card.set_yubikey_id(card_id);
        Self {
            context: context.clone(),
            path: None,
            card,
            events,
        }
    }

    /// The card facade
    pub fn card(&self) -> &YubiKeyCard {
        &self.card
    }

    /// Next event of the card
    pub async fn next_event(&mut self) -> Result<CardEvent> {
        match timeout(STEP_TIMEOUT, self.events.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(eyre!("Card facade dropped")),
            Err(_) => Err(eyre!("Timed out waiting for the card")),
        }
    }

    /// Wait until `done` holds for the card
    pub async fn wait_for(&mut self, done: impl Fn(&YubiKeyCard) -> bool) -> Result<()> {
        while !done(&self.card) {
            let event = self.next_event().await?;
            debug!(?event, "Waiting");
        }
        Ok(())
    }

    /// Wait until the card reports whether we may read it
    pub async fn access(&mut self) -> Result<AuthAccess> {
        self.wait_for(|card| !card.present() || card.auth_access() != AuthAccess::Unknown)
            .await?;
        if !self.card.present() {
            bail!("Card is not present");
        }
        Ok(self.card.auth_access())
    }

    /// Get read access, using the password if the card asks for one, and
    /// wait for the credential list
    pub async fn authorize(&mut self, password: &PasswordArgs) -> Result<()> {
        if self.access().await? == AuthAccess::Denied {
            let Some(secret) = &password.password else {
                bail!("The card is password protected, use --password");
            };
            self.card.submit_password(secret, password.remember)?;
            while !self.card.auth_access().has_access() {
                if self.next_event().await? == CardEvent::AccessKeyNotAccepted {
                    bail!("Wrong password");
                }
            }
        }
        self.settle().await
    }

    /// Wait for the credential list and every pending operation
    pub async fn settle(&mut self) -> Result<()> {
        self.wait_for(|card| card.otp_list_fetched() && card.operation_ids().is_empty())
            .await
    }

    /// Wait for operation `id` to finish, returning whether it succeeded
    pub async fn finish(&mut self, id: u32) -> Result<bool> {
        loop {
            if let CardEvent::OperationFinished { id: finished, success } =
                self.next_event().await?
            {
                if finished == id {
                    return Ok(success);
                }
            }
        }
    }

    /// Give the tag back
    pub fn close(self) {
        if let Some(path) = &self.path {
            self.context.tag_gone(path);
        }
    }
}
