use anyhow::{Result, anyhow};

use crate::models::message::Recipient;

pub fn validate_email_address(address: &str) -> Result<()> {
    if address.is_empty() {
        return Err(anyhow!("Email address cannot be empty"));
    }

    if address.len() > 320 {
        return Err(anyhow!("Email address too long (maximum 320 characters)"));
    }

    if address.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(anyhow!("Email address contains whitespace or control characters"));
    }

    let (local, domain) = address
        .rsplit_once('@')
        .ok_or_else(|| anyhow!("Email address '{}' is missing '@'", address))?;

    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return Err(anyhow!("Email address '{}' is malformed", address));
    }

    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(anyhow!("Email address '{}' has an invalid domain", address));
    }

    Ok(())
}

pub fn validate_recipient(recipient: &Recipient) -> Result<()> {
    if recipient.address.trim().is_empty() {
        return Err(anyhow!("Recipient address cannot be empty"));
    }

    if recipient.address.len() > 320 {
        return Err(anyhow!("Recipient address too long (maximum 320 characters)"));
    }

    for (backend, id) in &recipient.channel_ids {
        if id.trim().is_empty() {
            return Err(anyhow!("Empty channel id for backend '{}'", backend));
        }
    }

    Ok(())
}

pub fn validate_backend_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');

    if !valid {
        return Err(anyhow!("Invalid backend name '{}'", name));
    }

    Ok(())
}
