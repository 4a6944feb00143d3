//! API key input for secrets that do not exist yet

use crate::error::{DeployError, Result};
use secrecy::SecretString;

/// Asks for the value of a secret about to be created
///
/// Only called when the secret is absent; existing secrets are never
/// re-prompted or overwritten.
pub trait SecretPrompt: Send + Sync {
    fn secret(&self, secret_name: &str, label: &str) -> Result<SecretString>;
}

/// Hidden terminal input; an empty answer stores an empty key
pub struct DialoguerPrompt;

impl SecretPrompt for DialoguerPrompt {
    fn secret(&self, secret_name: &str, label: &str) -> Result<SecretString> {
        let value = dialoguer::Password::with_theme(&dialoguer::theme::ColorfulTheme::default())
            .with_prompt(format!("Creating {} - {}", secret_name, label))
            .allow_empty_password(true)
            .interact()
            .map_err(|e| DeployError::Prompt(e.to_string()))?;
        Ok(SecretString::from(value.trim().to_string()))
    }
}

/// `--non-interactive`: every key is left empty
pub struct EmptyPrompt;

impl SecretPrompt for EmptyPrompt {
    fn secret(&self, secret_name: &str, _label: &str) -> Result<SecretString> {
        tracing::debug!(secret_name, "Non-interactive run, leaving key empty");
        Ok(SecretString::from(String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_empty_prompt() {
        let value = EmptyPrompt.secret("tavilyapikey-demo", "Tavily API Key").unwrap();
        assert_eq!(value.expose_secret(), "");
    }
}
