//! Commands for reading and managing credentials

use eyre::{Result, bail, eyre};
use tracing::debug;
use ykoath::Token;

use crate::utils::session::Connection;
use crate::utils::{self, PasswordArgs};

/// Print every credential with its code
pub async fn codes_command(
    connection: &mut Connection,
    password: &PasswordArgs,
    refresh: bool,
) -> Result<()> {
    connection.authorize(password).await?;

    let names = connection.card().refreshable_tokens();
    if refresh && !names.is_empty() {
        debug!(?names, "Calculating one by one");
        let id = connection
            .card()
            .refresh_tokens(&names)
            .ok_or_else(|| eyre!("Card is not present"))?;
        connection.finish(id).await?;
    }

    let card = connection.card();
    utils::print_entries(&card.entries(), card.totp_time_left());
    Ok(())
}

/// Store a credential
pub async fn put_command(
    connection: &mut Connection,
    password: &PasswordArgs,
    token: Token,
) -> Result<()> {
    connection.authorize(password).await?;
    let id = connection.card().put_token(&token)?;
    if !connection.finish(id).await? {
        bail!("Card refused the credential");
    }
    println!("Stored {}", token.name());
    Ok(())
}

/// Delete credentials by name
pub async fn delete_command(
    connection: &mut Connection,
    password: &PasswordArgs,
    names: &[String],
) -> Result<()> {
    connection.authorize(password).await?;
    let id = connection
        .card()
        .delete_tokens(names)
        .ok_or_else(|| eyre!("Card is not present"))?;
    if !connection.finish(id).await? {
        bail!("Delete failed");
    }
    connection.settle().await?;

    let remaining = connection.card().entries();
    for name in names {
        if remaining.iter().any(|entry| &entry.name == name) {
            println!("{name} was not deleted");
        } else {
            println!("Deleted {name}");
        }
    }
    Ok(())
}

/// Calculate the named credentials and print their codes
pub async fn refresh_command(
    connection: &mut Connection,
    password: &PasswordArgs,
    names: &[String],
) -> Result<()> {
    connection.authorize(password).await?;
    let id = connection
        .card()
        .refresh_tokens(names)
        .ok_or_else(|| eyre!("Card is not present"))?;
    let success = connection.finish(id).await?;

    let entries: Vec<_> = connection
        .card()
        .entries()
        .into_iter()
        .filter(|entry| names.contains(&entry.name))
        .collect();
    utils::print_entries(&entries, 0);
    if !success {
        bail!("Some credentials could not be calculated");
    }
    Ok(())
}
