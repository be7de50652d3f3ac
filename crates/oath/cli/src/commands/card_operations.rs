//! Commands acting on the card as a whole

use eyre::{Result, bail};
use tracing::info;

use crate::utils::PasswordArgs;
use crate::utils::session::Connection;

/// Show what the applet reported when selected
pub async fn info_command(connection: &mut Connection) -> Result<()> {
    let access = connection.access().await?;
    let card = connection.card();

    println!("Card id:   {}", card.yubikey_id());
    println!("Version:   {}", card.yubikey_version());
    println!("Access:    {access}");
    println!("State:     {}", card.yubikey_state());
    Ok(())
}

/// Set or remove the access code
pub async fn set_password_command(
    connection: &mut Connection,
    password: &PasswordArgs,
    new_password: &str,
) -> Result<()> {
    connection.authorize(password).await?;
    let id = connection.card().set_password(new_password)?;
    if !connection.finish(id).await? {
        bail!("Failed to change the password");
    }

    if new_password.is_empty() {
        println!("Password removed");
        return Ok(());
    }
    if password.remember {
        connection.card().submit_password(new_password, true)?;
        info!("New password remembered");
    }
    println!("Password set");
    Ok(())
}

/// Factory reset the OATH applet
pub async fn reset_command(connection: &mut Connection, force: bool) -> Result<()> {
    if !force {
        bail!("Resetting erases every credential and the password, use --force");
    }
    connection.access().await?;
    let id = connection.card().reset()?;
    if !connection.finish(id).await? {
        bail!("Reset failed");
    }
    println!("OATH applet reset");
    Ok(())
}
