//! PII detection and pseudonymization.
//!
//! Regex detectors for email, phone, SSN, IBAN and credit-card numbers
//! (with Luhn validation), plus schema-annotated field names. Detected
//! values are replaced in-place by opaque UUIDs; the reverse mapping lives
//! in the role-gated `pii_map` keyspace.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use uuid::Uuid;

/// Kind of PII a detector matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Email,
    Phone,
    Ssn,
    Iban,
    CreditCard,
    DeclaredField,
}

/// One replacement performed by the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiReplacement {
    pub token: Uuid,
    pub kind: PiiKind,
    /// The original plaintext; persisted only in the pii_map keyspace.
    pub original: String,
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap())
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\+?[0-9][0-9 ()/\-]{7,18}[0-9]").unwrap()
    })
}

fn ssn_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[0-9]{3}-[0-9]{2}-[0-9]{4}\b").unwrap())
}

fn iban_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z]{2}[0-9]{2}[A-Z0-9]{11,30}\b").unwrap())
}

fn card_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:[0-9][ -]?){12,18}[0-9]\b").unwrap())
}

/// Luhn checksum over the digits of a candidate card number.
fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// PII detector with a set of schema-annotated sensitive field names.
#[derive(Debug, Clone, Default)]
pub struct PiiDetector {
    declared_fields: BTreeSet<String>,
}

impl PiiDetector {
    pub fn new(declared_fields: BTreeSet<String>) -> Self {
        Self { declared_fields }
    }

    /// Whether a field name is schema-annotated as sensitive.
    pub fn is_declared(&self, field: &str) -> bool {
        self.declared_fields.contains(field)
    }

    /// Scan a text value; return the anonymized text plus replacements.
    ///
    /// Detection order matters: structured formats (email, IBAN, SSN) run
    /// before the looser phone/card patterns so a match is claimed by the
    /// most specific detector.
    pub fn anonymize_text(&self, text: &str) -> (String, Vec<PiiReplacement>) {
        let mut replacements = Vec::new();
        let mut out = text.to_string();

        for (kind, re) in [
            (PiiKind::Email, email_re()),
            (PiiKind::Iban, iban_re()),
            (PiiKind::Ssn, ssn_re()),
        ] {
            out = replace_all(&out, re, kind, &mut replacements, |_| true);
        }
        out = replace_all(&out, card_re(), PiiKind::CreditCard, &mut replacements, luhn_valid);
        out = replace_all(&out, phone_re(), PiiKind::Phone, &mut replacements, |m| {
            m.chars().filter(|c| c.is_ascii_digit()).count() >= 8
        });

        (out, replacements)
    }

    /// Anonymize a whole field value: declared fields are replaced
    /// wholesale, free text is scanned.
    pub fn anonymize_field(&self, field: &str, value: &str) -> (String, Vec<PiiReplacement>) {
        if self.is_declared(field) {
            let token = Uuid::new_v4();
            return (
                token.to_string(),
                vec![PiiReplacement {
                    token,
                    kind: PiiKind::DeclaredField,
                    original: value.to_string(),
                }],
            );
        }
        self.anonymize_text(value)
    }
}

fn replace_all(
    text: &str,
    re: &Regex,
    kind: PiiKind,
    replacements: &mut Vec<PiiReplacement>,
    accept: impl Fn(&str) -> bool,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0usize;
    for m in re.find_iter(text) {
        if !accept(m.as_str()) {
            continue;
        }
        let token = Uuid::new_v4();
        out.push_str(&text[last..m.start()]);
        out.push_str(&token.to_string());
        replacements.push(PiiReplacement {
            token,
            kind,
            original: m.as_str().to_string(),
        });
        last = m.end();
    }
    out.push_str(&text[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_detection() {
        let det = PiiDetector::default();
        let (out, reps) = det.anonymize_text("contact ada@example.org for details");
        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].kind, PiiKind::Email);
        assert!(!out.contains("ada@example.org"));
        assert!(out.contains(&reps[0].token.to_string()));
    }

    #[test]
    fn test_luhn_accepts_valid_card_only() {
        assert!(luhn_valid("4532015112830366"));
        assert!(!luhn_valid("4532015112830367"));

        let det = PiiDetector::default();
        let (out, reps) = det.anonymize_text("card 4532015112830366 on file");
        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].kind, PiiKind::CreditCard);
        assert!(!out.contains("4532015112830366"));
    }

    #[test]
    fn test_invalid_card_left_alone_unless_phone_shaped() {
        let det = PiiDetector::default();
        // Fails Luhn; the digit run is then claimed by the phone detector,
        // which is the intended conservative behavior.
        let (_, reps) = det.anonymize_text("ref 4532015112830367");
        assert!(reps.iter().all(|r| r.kind != PiiKind::CreditCard));
    }

    #[test]
    fn test_iban_and_ssn() {
        let det = PiiDetector::default();
        let (_, reps) = det.anonymize_text("DE89370400440532013000 and 078-05-1120");
        let kinds: Vec<_> = reps.iter().map(|r| r.kind).collect();
        assert!(kinds.contains(&PiiKind::Iban));
        assert!(kinds.contains(&PiiKind::Ssn));
    }

    #[test]
    fn test_declared_field_replaced_wholesale() {
        let mut declared = BTreeSet::new();
        declared.insert("patient_name".to_string());
        let det = PiiDetector::new(declared);
        let (out, reps) = det.anonymize_field("patient_name", "Ada Lovelace");
        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].kind, PiiKind::DeclaredField);
        assert_eq!(out, reps[0].token.to_string());
    }

    #[test]
    fn test_clean_text_untouched() {
        let det = PiiDetector::default();
        let (out, reps) = det.anonymize_text("nothing sensitive here");
        assert!(reps.is_empty());
        assert_eq!(out, "nothing sensitive here");
    }
}
