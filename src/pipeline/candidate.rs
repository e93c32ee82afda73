//! Turns a decoded message into a candidate order.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::documents::extractor_for;
use crate::documents::numbers::NumberLocale;
use crate::mailbox::{DecodedMessage, MessageHandle};
use crate::pipeline::rules::{FieldRules, normalize_text};
use crate::pipeline::types::{
    Advisory, AdvisoryKind, CandidateOrder, ConfirmationState, CustomerHeader, DuplicateStatus,
    ValidationOutcome,
};

/// Applies extractors and field rules to decoded messages.
pub struct CandidateAssembler<'a> {
    rules: &'a FieldRules,
    locale: NumberLocale,
}

impl<'a> CandidateAssembler<'a> {
    pub fn new(rules: &'a FieldRules, locale: NumberLocale) -> Self {
        Self { rules, locale }
    }

    /// Build a candidate. Extraction problems become advisories on
    /// `validation`; the candidate is always returned.
    ///
    /// `fallback_date` is used when the message has no `Date` header.
    pub fn assemble(&self, message: &DecodedMessage, fallback_date: DateTime<Utc>) -> CandidateOrder {
        let mut advisories = Vec::new();
        let body = normalize_text(&message.text_body);

        let (header, line_items, document_text) = match message.payload() {
            Some((kind, payload)) => match extractor_for(kind, self.locale).extract(payload, self.rules) {
                Ok(doc) => {
                    let header = if doc.advisories.is_empty() || body.trim().is_empty() {
                        advisories.extend(doc.advisories);
                        doc.header
                    } else {
                        // Fill fields the document lacks from the covering message.
                        let merged = self.rules.extract_header(&[&doc.text, &body]);
                        advisories.extend(merged.advisories);
                        merged.header
                    };
                    (header, doc.line_items, doc.text)
                }
                Err(e) => {
                    warn!(handle = %message.handle, error = %e, "Document extraction failed");
                    advisories.push(Advisory::new(AdvisoryKind::ExtractionError, e.to_string()));
                    let fallback = self.rules.extract_header(&[&body]);
                    advisories.extend(fallback.advisories);
                    (fallback.header, Vec::new(), String::new())
                }
            },
            None => {
                advisories.push(Advisory::new(
                    AdvisoryKind::ExtractionError,
                    "message has neither an HTML body nor an attachment",
                ));
                (CustomerHeader::default(), Vec::new(), String::new())
            }
        };

        let origin_code = self
            .rules
            .origin_code(&[&message.subject, &body, &document_text])
            .unwrap_or_default();
        if origin_code.is_empty() {
            advisories.push(Advisory::field_missing("origin_code"));
        }

        let message_date = match message.date {
            Some(date) => date,
            None => {
                advisories.push(Advisory::new(
                    AdvisoryKind::FieldMissing,
                    "message has no date; using the start of the search window",
                ));
                fallback_date
            }
        };

        let candidate = CandidateOrder {
            origin_code,
            alternate_origin_code: None,
            message_handle: Some(message.handle.to_string()),
            message_date,
            confirmation_state: ConfirmationState::from_subject(&message.subject),
            internal_reference_number: self.rules.reference_number(&body),
            archived_document_path: None,
            header,
            line_items,
            validation: ValidationOutcome::failed(advisories),
            duplicate: DuplicateStatus::New,
            document: message.attachment.as_ref().map(|a| a.bytes.clone()),
        };

        debug!(
            handle = %message.handle,
            origin_code = %candidate.origin_code,
            items = candidate.line_items.len(),
            state = %candidate.confirmation_state,
            "Candidate assembled"
        );
        candidate
    }

    /// Candidate for a message that could not be decoded at all.
    pub fn unreadable(handle: &MessageHandle, date: DateTime<Utc>, reason: &str) -> CandidateOrder {
        CandidateOrder {
            origin_code: String::new(),
            alternate_origin_code: None,
            message_handle: Some(handle.to_string()),
            message_date: date,
            confirmation_state: ConfirmationState::default(),
            internal_reference_number: None,
            archived_document_path: None,
            header: CustomerHeader::default(),
            line_items: Vec::new(),
            validation: ValidationOutcome::failed(vec![Advisory::new(
                AdvisoryKind::ExtractionError,
                reason,
            )]),
            duplicate: DuplicateStatus::New,
            document: None,
        }
    }
}
