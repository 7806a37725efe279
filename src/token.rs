//! Spotify access token.
//!
//! The OAuth exchange happens elsewhere; this module only reads a token that
//! was obtained out of band from a small TOML secrets file:
//!
//! ```toml
//! access_token = "BQD..."
//! ```

use std::{fmt, fs, str::FromStr};

use veil::Redact;

use crate::error::{Error, Result};

/// Bearer token for the Web API and the Web Playback SDK.
///
/// Redacted from `Debug` output so it does not end up in logs.
#[derive(Clone, PartialEq, Eq, Hash, Redact)]
#[redact(all)]
pub struct AccessToken(String);

impl AccessToken {
    /// Secrets files are tiny. Anything larger is not ours.
    const MAX_FILE_SIZE: u64 = 4096;

    /// Loads the token from the `access_token` key of a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is too large, is not
    /// valid TOML, or does not hold a valid token.
    pub fn from_file(path: &str) -> Result<Self> {
        let attributes = fs::metadata(path)?;
        let file_size = attributes.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::invalid_argument(format!(
                "{path} is too large ({file_size} bytes)"
            )));
        }

        let contents = fs::read_to_string(path)?;
        let value = contents.parse::<toml::Table>()?;
        match value.get("access_token").and_then(toml::Value::as_str) {
            Some(token) => token.parse(),
            None => Err(Error::invalid_argument(format!(
                "{path} does not contain an access_token"
            ))),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AccessToken {
    type Err = Error;

    /// Access tokens are opaque, but always printable ASCII without
    /// whitespace or quotes.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let token = s.trim();
        if token.is_empty() {
            return Err(Error::invalid_argument("access token is empty"));
        }

        if let Some(chr) = token
            .chars()
            .find(|chr| !chr.is_ascii_graphic() || matches!(chr, '"' | '\'' | '\\'))
        {
            return Err(Error::invalid_argument(format!(
                "access token contains illegal character {chr:?}"
            )));
        }

        Ok(Self(token.to_owned()))
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_trims() {
        let token: AccessToken = "  BQDabc-123_xyz.  ".parse().unwrap();
        assert_eq!(token.as_str(), "BQDabc-123_xyz.");
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<AccessToken>().is_err());
        assert!("abc def".parse::<AccessToken>().is_err());
        assert!("abc'; alert(1); '".parse::<AccessToken>().is_err());
    }

    #[test]
    fn debug_is_redacted() {
        let token: AccessToken = "BQDsecret".parse().unwrap();
        assert!(!format!("{token:?}").contains("BQDsecret"));
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("spoli-secrets-{}.toml", std::process::id()));
        fs::write(&path, "access_token = \"BQDfromfile\"\n").unwrap();

        let token = AccessToken::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(token.as_str(), "BQDfromfile");

        fs::remove_file(&path).unwrap();
    }
}
