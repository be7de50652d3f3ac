//! Follow tags on every reader

use std::rc::Rc;

use colored::Colorize;
use eyre::Result;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use ykoath::{ContextEvent, OathContext, TagLink};
use ykoath_apdu_transport_pcsc::{PcscDeviceManager, TagEvent, tag_event_channel};

use crate::utils::session::Connection;
use crate::utils::{self, PasswordArgs};

/// Show the codes of each YubiKey as it enters a field, until interrupted
pub async fn watch_command(
    manager: &PcscDeviceManager,
    context: &OathContext,
    password: &PasswordArgs,
) -> Result<()> {
    let (tx, rx) = tag_event_channel();
    let monitor = manager.monitor()?;
    monitor.start(tx)?;

    // The monitor channel blocks, forward it from a blocking thread
    let (tag_tx, mut tag_events) = mpsc::unbounded_channel();
    tokio::task::spawn_blocking(move || {
        while let Ok(event) = rx.recv() {
            if tag_tx.send(event).is_err() {
                break;
            }
        }
    });

    let (context_tx, mut context_events) = mpsc::unbounded_channel();
    let listener = context.subscribe(move |event| {
        let _ = context_tx.send(event.clone());
    });

    println!("Waiting for tags, Ctrl-C to stop");
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            Some(event) = tag_events.recv() => on_tag_event(manager, context, event),
            Some(event) = context_events.recv() => match event {
                ContextEvent::TagRecognized { path, card_id } => {
                    let connection = Connection::bind(context, &card_id);
                    tokio::task::spawn_local(show_codes(connection, path, password.clone()));
                }
                ContextEvent::TagUnrecognized { path } => {
                    println!("{}", format!("{path}: not a YubiKey").dimmed());
                }
                ContextEvent::TagGone { path } => debug!(path, "Tag gone"),
            },
            else => break,
        }
    }

    monitor.stop();
    context.unsubscribe(listener);
    for path in context.present_tags() {
        context.tag_gone(&path);
    }
    Ok(())
}

fn on_tag_event(manager: &PcscDeviceManager, context: &OathContext, event: TagEvent) {
    match event {
        TagEvent::Present {
            reader,
            iso_dep: true,
            ..
        } => match manager.open_tag(&reader) {
            Ok(tag) => context.tag_arrived(&reader, TagLink::IsoDep(Rc::new(tag))),
            Err(e) => warn!(reader, "Failed to open tag: {}", e),
        },
        TagEvent::Present { reader, .. } => context.tag_arrived(&reader, TagLink::Other),
        TagEvent::Gone { reader } => context.tag_gone(&reader),
    }
}

async fn show_codes(mut connection: Connection, path: String, password: PasswordArgs) {
    let header = format!("{path}: YubiKey {}", connection.card().yubikey_id());
    match connection.authorize(&password).await {
        Ok(()) => {
            println!("{}", header.bold());
            let card = connection.card();
            utils::print_entries(&card.entries(), card.totp_time_left());
        }
        Err(e) => println!("{}: {}", header.bold(), e.to_string().red()),
    }
}
