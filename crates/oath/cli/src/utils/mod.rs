//! Utility functions and types for the YKOATH CLI

pub mod reader;
pub mod session;

use clap::Args;
use colored::Colorize;
use eyre::{Result, eyre};
use ykoath::{Algorithm, Code, OtpEntry, Token, TokenType};

/// Access code of a protected card
#[derive(Args, Debug, Clone)]
pub struct PasswordArgs {
    /// Password of the card, if it has one
    #[arg(short, long, global = true)]
    pub password: Option<String>,

    /// Store the derived key so later runs don't need the password
    #[arg(long, global = true, requires = "password")]
    pub remember: bool,
}

/// Arguments for a new credential
#[derive(Args, Debug, Clone)]
pub struct PutArgs {
    /// Account name
    #[arg(required = true)]
    pub label: String,

    /// Shared secret, base32 encoded
    #[arg(required = true)]
    pub secret: String,

    /// Issuer, stored as `issuer:label`
    #[arg(long)]
    pub issuer: Option<String>,

    /// Counter based instead of time based
    #[arg(long)]
    pub hotp: bool,

    /// HMAC digest
    #[arg(long, value_enum, default_value_t = Algorithm::Sha1)]
    pub algorithm: Algorithm,

    /// Code length
    #[arg(long, default_value_t = 6)]
    pub digits: u8,

    /// Initial HOTP counter
    #[arg(long, default_value_t = 0)]
    pub counter: u32,

    /// Require a touch for every code
    #[arg(long)]
    pub touch: bool,
}

impl PutArgs {
    /// Build the credential, checking what the card would reject
    pub fn token(&self) -> Result<Token> {
        let token_type = if self.hotp {
            TokenType::Hotp
        } else {
            TokenType::Totp
        };
        let token = Token::new(token_type, self.label.as_str(), decode_secret(&self.secret)?)
            .with_issuer(self.issuer.clone().unwrap_or_default())
            .with_algorithm(self.algorithm)
            .with_digits(self.digits)
            .with_counter(self.counter)
            .with_touch(self.touch);
        token.validate()?;
        Ok(token)
    }
}

/// Decode a base32 secret as shown by providers: any case, spaces and
/// padding allowed
pub fn decode_secret(secret: &str) -> Result<Vec<u8>> {
    let cleaned: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &cleaned)
        .filter(|secret| !secret.is_empty())
        .ok_or_else(|| eyre!("Secret is not valid base32"))
}

/// Print credentials with their codes
pub fn print_entries(entries: &[OtpEntry], time_left: u32) {
    if entries.is_empty() {
        println!("No credentials stored");
        return;
    }

    let width = entries.iter().map(|e| e.name.len()).max().unwrap_or_default();
    for entry in entries {
        let code = match (entry.display_code(), entry.code) {
            (Some(code), _) => code.green().bold(),
            (None, Some(Code::RequiresTouch)) => "[touch]".yellow(),
            (None, _) if entry.token_type == Some(TokenType::Hotp) => "[HOTP]".yellow(),
            (None, _) => "-".dimmed(),
        };
        println!("{:width$}  {}", entry.name, code);
    }
    if time_left > 0 {
        println!("{}", format!("Valid for {time_left}s").dimmed());
    }
}
