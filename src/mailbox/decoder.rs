//! MIME decoding of fetched order messages using `mail-parser`.

use chrono::{DateTime, Utc};
use mail_parser::{Message, MessageParser, MimeHeaders, PartType};
use tracing::debug;

use crate::documents::PayloadKind;
use crate::error::ExtractionError;
use crate::mailbox::MessageHandle;

/// Nested `message/rfc822` parts deeper than this are not searched.
const MAX_NESTING: usize = 8;

/// A document attachment carried by the message.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub kind: PayloadKind,
    pub bytes: Vec<u8>,
}

/// The parts of a message the pipeline reads.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub handle: MessageHandle,
    pub subject: String,
    /// `None` when the message carries no usable `Date` header.
    pub date: Option<DateTime<Utc>>,
    /// Only set for a genuine `text/html` part.
    pub html_body: Option<String>,
    /// Plain text of the covering message.
    pub text_body: String,
    /// First PDF attachment, searched through forwarded messages.
    pub attachment: Option<Attachment>,
}

impl DecodedMessage {
    /// Payload to extract from: the PDF when present, else the HTML body.
    pub fn payload(&self) -> Option<(PayloadKind, &[u8])> {
        if let Some(att) = &self.attachment {
            return Some((att.kind, att.bytes.as_slice()));
        }
        self.html_body
            .as_deref()
            .map(|html| (PayloadKind::Html, html.as_bytes()))
    }
}

/// Decode raw RFC 5322 bytes.
///
/// Fails when the message has neither an HTML body nor a document
/// attachment: `UnsupportedPayload` if it carries attachments of another
/// type, `NoContent` otherwise.
pub fn decode_message(handle: &MessageHandle, raw: &[u8]) -> Result<DecodedMessage, ExtractionError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| ExtractionError::Mime {
            handle: handle.to_string(),
        })?;

    let subject = parsed.subject().unwrap_or_default().trim().to_string();
    let date = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0));

    let html_body = parsed.html_bodies().find_map(|part| match &part.body {
        PartType::Html(html) => Some(html.to_string()),
        _ => None,
    });

    let text_body = match parsed.body_text(0) {
        Some(text) => text.to_string(),
        None => html_body.as_deref().map(strip_html).unwrap_or_default(),
    };

    let mut skipped = None;
    let attachment = find_document(&parsed, 0, &mut skipped);

    if html_body.is_none() && attachment.is_none() {
        return Err(match skipped {
            Some(content_type) => ExtractionError::UnsupportedPayload(content_type),
            None => ExtractionError::NoContent {
                handle: handle.to_string(),
            },
        });
    }

    debug!(
        handle = %handle,
        subject = %subject,
        has_html = html_body.is_some(),
        attachment = attachment.as_ref().map(|a| a.name.as_str()),
        "Decoded message"
    );

    Ok(DecodedMessage {
        handle: handle.clone(),
        subject,
        date,
        html_body,
        text_body,
        attachment,
    })
}

/// Depth-first search for the first PDF attachment. The content type of the
/// first attachment passed over is left in `skipped`.
fn find_document(message: &Message<'_>, depth: usize, skipped: &mut Option<String>) -> Option<Attachment> {
    if depth > MAX_NESTING {
        return None;
    }
    for part in message.attachments() {
        if let PartType::Message(inner) = &part.body {
            if let Some(found) = find_document(inner, depth + 1, skipped) {
                return Some(found);
            }
            continue;
        }

        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_default();
        let name = part.attachment_name().unwrap_or("attachment").to_string();
        let bytes = part.contents();

        let is_pdf = PayloadKind::from_content_type(&content_type) == Some(PayloadKind::Pdf)
            || name.to_lowercase().ends_with(".pdf")
            || PayloadKind::sniff(bytes) == Some(PayloadKind::Pdf);
        if is_pdf {
            return Some(Attachment {
                name,
                content_type,
                kind: PayloadKind::Pdf,
                bytes: bytes.to_vec(),
            });
        }
        debug!(name = %name, content_type = %content_type, "Ignoring non-document attachment");
        skipped.get_or_insert(content_type);
    }
    None
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> MessageHandle {
        MessageHandle::new("17")
    }

    const PDF_MESSAGE: &str = "From: oc@portal.cl\r\n\
To: ventas@example.cl\r\n\
Subject: Orden de Compra CONFIRMADA OC-4500012345\r\n\
Date: Tue, 3 Mar 2026 14:05:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Su pedido interno 884213 fue recibido.\r\n\
--XX\r\n\
Content-Type: application/pdf; name=\"oc.pdf\"\r\n\
Content-Disposition: attachment; filename=\"oc.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQKJcOkw7zDtsOf\r\n\
--XX--\r\n";

    #[test]
    fn decodes_pdf_attachment_and_body() {
        let msg = decode_message(&handle(), PDF_MESSAGE.as_bytes()).unwrap();
        assert_eq!(msg.subject, "Orden de Compra CONFIRMADA OC-4500012345");
        assert_eq!(msg.date.unwrap().to_rfc3339(), "2026-03-03T14:05:00+00:00");
        assert!(msg.text_body.contains("884213"));
        assert!(msg.html_body.is_none());
        let att = msg.attachment.as_ref().unwrap();
        assert_eq!(att.kind, PayloadKind::Pdf);
        assert!(att.bytes.starts_with(b"%PDF-"));
        assert_eq!(msg.payload().unwrap().0, PayloadKind::Pdf);
    }

    #[test]
    fn html_body_is_the_fallback_payload() {
        let raw = "From: oc@portal.cl\r\n\
Subject: Orden de Compra\r\n\
MIME-Version: 1.0\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><body><p>RUT: 77.337.586-0</p></body></html>\r\n";
        let msg = decode_message(&handle(), raw.as_bytes()).unwrap();
        assert!(msg.date.is_none());
        assert!(msg.attachment.is_none());
        assert_eq!(msg.payload().unwrap().0, PayloadKind::Html);
        assert!(msg.text_body.contains("77.337.586-0"));
    }

    #[test]
    fn plain_text_only_has_no_content() {
        let raw = "From: oc@portal.cl\r\n\
Subject: Orden de Compra\r\n\
Content-Type: text/plain\r\n\
\r\n\
Sin adjunto.\r\n";
        let err = decode_message(&handle(), raw.as_bytes()).unwrap_err();
        assert!(matches!(err, ExtractionError::NoContent { .. }));
    }

    #[test]
    fn spreadsheet_only_is_unsupported() {
        let raw = "From: oc@portal.cl\r\n\
Subject: Orden de Compra OC-12\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: text/plain\r\n\
\r\n\
Adjunto planilla.\r\n\
--XX\r\n\
Content-Type: application/vnd.ms-excel; name=\"oc.xls\"\r\n\
Content-Disposition: attachment; filename=\"oc.xls\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
0M8R4KGxGuE=\r\n\
--XX--\r\n";
        let err = decode_message(&handle(), raw.as_bytes()).unwrap_err();
        assert!(
            matches!(&err, ExtractionError::UnsupportedPayload(ct) if ct == "application/vnd.ms-excel"),
            "{err}"
        );
    }

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
        assert_eq!(strip_html("<td>A</td><td>B</td>"), "A B");
        assert_eq!(strip_html("No HTML here"), "No HTML here");
        assert_eq!(strip_html(""), "");
    }
}
