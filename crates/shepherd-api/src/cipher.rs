//! Playbook payload transform
//!
//! Payloads travel sealed per host. The control plane seals with the target
//! host name as salt and the agent opens with its own name. The actual scheme
//! is supplied by the deployment; [`PlainText`] passes content through.

use thiserror::Error;

/// Errors raised when a sealed payload cannot be opened
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Payload is not valid for this salt
    #[error("cannot open payload for {salt}: {reason}")]
    Open {
        /// Salt the payload was opened with
        salt: String,
        /// Underlying reason
        reason: String,
    },
}

/// Deterministic-per-salt payload transform
pub trait PayloadCipher: Send + Sync {
    /// Seal `plaintext` for the host identified by `salt`
    fn seal(&self, salt: &str, plaintext: &str) -> String;

    /// Open a payload previously sealed with the same `salt`
    ///
    /// # Errors
    /// Returns [`CipherError`] if the payload was not sealed for `salt`
    fn open(&self, salt: &str, sealed: &str) -> Result<String, CipherError>;
}

/// Identity transform
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainText;

impl PayloadCipher for PlainText {
    fn seal(&self, _salt: &str, plaintext: &str) -> String {
        plaintext.to_string()
    }

    fn open(&self, _salt: &str, sealed: &str) -> Result<String, CipherError> {
        Ok(sealed.to_string())
    }
}
