//! Dispatch envelope sent on `fleet.<host>.playbook`

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors decoding an inbound envelope
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Payload was not a JSON envelope
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// JSON envelope `{host, playbook, payload, deploy}`
///
/// Every field is optional on the wire; absent fields decode to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Target host name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Playbook identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook: Option<String>,
    /// Sealed playbook content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Deploy identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<String>,
}

impl Envelope {
    /// Build a fully populated envelope
    pub fn new(
        host: impl Into<String>,
        playbook: impl Into<String>,
        payload: impl Into<String>,
        deploy: impl Into<String>,
    ) -> Self {
        Self {
            host: Some(host.into()),
            playbook: Some(playbook.into()),
            payload: Some(payload.into()),
            deploy: Some(deploy.into()),
        }
    }

    /// Encode to JSON bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        // A struct of optional strings always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode from JSON bytes
    ///
    /// # Errors
    /// Returns [`EnvelopeError::Malformed`] if `data` is not an envelope object
    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_field_names() {
        let env = Envelope::new("web1", "base", "payload", "d-1");
        let value: serde_json::Value = serde_json::from_slice(&env.encode()).unwrap();

        assert_eq!(value["host"], "web1");
        assert_eq!(value["playbook"], "base");
        assert_eq!(value["payload"], "payload");
        assert_eq!(value["deploy"], "d-1");
    }

    #[test]
    fn test_envelope_recovers_identifiers() {
        let cases = [
            ("web1.example.com", "site.yml", "d-1"),
            ("db \"primary\"", "ünïcödé playbook", "0f8e-44"),
            ("", "", ""),
            ("host\twith\ttabs", "{json: like}", "a\\b"),
        ];

        for (host, playbook, deploy) in cases {
            let env = Envelope::new(host, playbook, "---", deploy);
            let decoded = Envelope::decode(&env.encode()).unwrap();

            assert_eq!(decoded.host.as_deref(), Some(host));
            assert_eq!(decoded.playbook.as_deref(), Some(playbook));
            assert_eq!(decoded.deploy.as_deref(), Some(deploy));
        }
    }

    #[test]
    fn test_envelope_missing_fields_are_none() {
        let env = Envelope::decode(br#"{"host":"web1"}"#).unwrap();

        assert_eq!(env.host.as_deref(), Some("web1"));
        assert!(env.playbook.is_none());
        assert!(env.payload.is_none());
        assert!(env.deploy.is_none());
    }

    #[test]
    fn test_envelope_malformed() {
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(b"").is_err());
        assert!(Envelope::decode(br#"{"host": 12}"#).is_err());
    }
}
