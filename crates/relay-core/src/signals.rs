//! Response inspection for reward penalties.
//!
//! Detects personal data and credentials in model output and turns the
//! findings into a privacy penalty in `[0, 1]`.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    /// Email address (RFC 5322 simplified)
    static ref EMAIL_PATTERN: Regex = Regex::new(
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}"
    ).unwrap();

    /// US phone number, optional country code
    static ref PHONE_PATTERN: Regex = Regex::new(
        r"(?:\+?1[-.\s]?)?(?:\([0-9]{3}\)|[0-9]{3})[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}"
    ).unwrap();

    static ref SSN_PATTERN: Regex = Regex::new(
        r"\b\d{3}[-\s]\d{2}[-\s]\d{4}\b"
    ).unwrap();

    /// 16 digits with optional separators
    static ref CARD_PATTERN: Regex = Regex::new(
        r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b"
    ).unwrap();

    static ref API_KEY_PATTERN: Regex = Regex::new(
        r#"(?i)(api[_-]?key|secret[_-]?key|access[_-]?token|auth[_-]?token|bearer|password|secret|token)[\s:=]+['"]?[a-zA-Z0-9_-]{16,}['"]?"#
    ).unwrap();

    static ref AWS_KEY_PATTERN: Regex = Regex::new(
        r"(AKIA|ABIA|ACCA|AGPA|AIDA|AIPA|ANPA|ANVA|AROA|ASCA|ASIA)[A-Z0-9]{16}"
    ).unwrap();
}

const PII_PENALTY: f64 = 0.25;
const CREDENTIAL_PENALTY: f64 = 0.5;

/// Category of sensitive content found in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Email,
    Phone,
    Ssn,
    CreditCard,
    ApiKey,
    AwsKey,
}

impl SignalKind {
    pub fn is_credential(self) -> bool {
        matches!(self, SignalKind::ApiKey | SignalKind::AwsKey)
    }
}

/// Findings from inspecting one response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseSignals {
    pub findings: Vec<SignalKind>,
}

impl ResponseSignals {
    pub fn inspect(text: &str) -> Self {
        let checks: [(SignalKind, &Regex); 6] = [
            (SignalKind::Email, &EMAIL_PATTERN),
            (SignalKind::Phone, &PHONE_PATTERN),
            (SignalKind::Ssn, &SSN_PATTERN),
            (SignalKind::CreditCard, &CARD_PATTERN),
            (SignalKind::ApiKey, &API_KEY_PATTERN),
            (SignalKind::AwsKey, &AWS_KEY_PATTERN),
        ];
        let findings = checks
            .iter()
            .filter(|(_, pattern)| pattern.is_match(text))
            .map(|(kind, _)| *kind)
            .collect();
        Self { findings }
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn has_credentials(&self) -> bool {
        self.findings.iter().any(|k| k.is_credential())
    }

    /// 0.25 per personal-data category, 0.5 per credential category, capped at 1.
    pub fn privacy_penalty(&self) -> f64 {
        self.findings
            .iter()
            .map(|k| {
                if k.is_credential() {
                    CREDENTIAL_PENALTY
                } else {
                    PII_PENALTY
                }
            })
            .sum::<f64>()
            .min(1.0)
    }
}
