//! Document extractors and payload type detection.
//!
//! Each backend (PDF, HTML) implements `DocumentExtractor` and yields the same
//! output: customer header fields plus the ordered product lines.
//! `extractor_for()` returns the backend for a payload kind.

pub mod html;
pub mod numbers;
pub mod pdf;
pub mod table;

use crate::documents::numbers::NumberLocale;
use crate::error::ExtractionError;
use crate::pipeline::rules::FieldRules;
use crate::pipeline::types::{Advisory, CustomerHeader, ExtractedLineItem};

/// Kind of payload an extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Pdf,
    Html,
}

impl PayloadKind {
    /// Detect from a MIME content type.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let ct = content_type.to_lowercase();
        if ct.contains("application/pdf") || ct.contains("application/x-pdf") {
            Some(Self::Pdf)
        } else if ct.contains("text/html") || ct.contains("application/xhtml") {
            Some(Self::Html)
        } else {
            None
        }
    }

    /// Detect from the payload bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF-") {
            return Some(Self::Pdf);
        }
        let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_lowercase();
        if head.contains("<html") || head.contains("<table") || head.contains("<!doctype html") {
            Some(Self::Html)
        } else {
            None
        }
    }
}

/// Output shared by every backend.
#[derive(Debug, Clone, Default)]
pub struct ExtractedDocument {
    pub header: CustomerHeader,
    /// Advisories for header fields the document did not carry.
    pub advisories: Vec<Advisory>,
    pub line_items: Vec<ExtractedLineItem>,
    /// Normalized document text, kept for the remaining field rules.
    pub text: String,
}

/// A document backend.
pub trait DocumentExtractor: Send + Sync {
    /// The payload kind this backend handles.
    fn kind(&self) -> PayloadKind;

    /// Extract header fields and product lines.
    ///
    /// A document without a recognizable product table is not an error; it
    /// yields zero line items.
    fn extract(&self, payload: &[u8], rules: &FieldRules) -> Result<ExtractedDocument, ExtractionError>;
}

/// Get the backend for a payload kind.
pub fn extractor_for(kind: PayloadKind, locale: NumberLocale) -> Box<dyn DocumentExtractor> {
    match kind {
        PayloadKind::Pdf => Box::new(pdf::PdfTableExtractor::new(locale)),
        PayloadKind::Html => Box::new(html::HtmlTableExtractor::new(locale)),
    }
}
