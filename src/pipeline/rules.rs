//! Label-anchored field extraction rules.
//!
//! Each rule pairs a label pattern with a capture window, an optional default
//! and a normalization. Rules run over normalized text:
//! - Header fields (tax id, legal name, address, ...) come from the document
//!   text, with the message body as a fallback.
//! - The origin code is searched in the subject, then the body, then the document.
//! - The internal reference number comes from the message body only.

use regex::Regex;
use tracing::debug;

use crate::pipeline::types::{Advisory, CustomerHeader};

/// Value window shared by the free-text labels: up to a column gap or end of line.
const TEXT_WINDOW: &str = r"\s*[:.]?\s*(\S.*?)(?:\s{2,}|\t|$)";

/// Header field a rule fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderField {
    TaxId,
    LegalName,
    Address,
    District,
    ShipmentType,
    Carrier,
}

impl HeaderField {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaxId => "tax_id",
            Self::LegalName => "legal_name",
            Self::Address => "address",
            Self::District => "district",
            Self::ShipmentType => "shipment_type",
            Self::Carrier => "carrier",
        }
    }

    /// Missing required fields produce an advisory.
    pub fn required(&self) -> bool {
        matches!(self, Self::TaxId | Self::LegalName)
    }

    fn slot<'a>(&self, header: &'a mut CustomerHeader) -> &'a mut String {
        match self {
            Self::TaxId => &mut header.tax_id,
            Self::LegalName => &mut header.legal_name,
            Self::Address => &mut header.address,
            Self::District => &mut header.district,
            Self::ShipmentType => &mut header.shipment_type,
            Self::Carrier => &mut header.carrier,
        }
    }
}

/// Post-capture normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalize {
    Trim,
    Upper,
    Lower,
}

impl Normalize {
    fn apply(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        match self {
            Self::Trim => trimmed.to_string(),
            Self::Upper => trimmed.to_uppercase(),
            Self::Lower => trimmed.to_lowercase(),
        }
    }
}

/// A single label-anchored rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct FieldRule {
    /// Human-readable label description.
    pub label: String,
    /// Compiled regex; capture group 1 is the value.
    pub regex: Regex,
    /// Value used when the label is absent.
    pub default: Option<String>,
    pub normalize: Normalize,
    /// Reject captures that are not purely numeric.
    pub numeric_only: bool,
}

impl FieldRule {
    pub fn new(label: &str, pattern: &str, normalize: Normalize) -> Result<Self, regex::Error> {
        Ok(Self {
            label: label.into(),
            regex: Regex::new(pattern)?,
            default: None,
            normalize,
            numeric_only: false,
        })
    }

    pub fn with_default(mut self, default: &str) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn numeric(mut self) -> Self {
        self.numeric_only = true;
        self
    }

    /// First acceptable capture in `text`, without applying the default.
    pub fn capture(&self, text: &str) -> Option<String> {
        for caps in self.regex.captures_iter(text) {
            let Some(m) = caps.get(1) else { continue };
            let value = self.normalize.apply(m.as_str());
            let value = value.trim_end_matches(['.', ',', ';']).to_string();
            if value.is_empty() {
                continue;
            }
            if self.numeric_only && !value.chars().all(|c| c.is_ascii_digit()) {
                debug!(
                    rule = %self.label,
                    value = %value,
                    "Rejected non-numeric capture"
                );
                continue;
            }
            return Some(value);
        }
        None
    }
}

/// Header fields plus advisories for the ones that were missing.
#[derive(Debug, Clone, Default)]
pub struct HeaderExtraction {
    pub header: CustomerHeader,
    pub advisories: Vec<Advisory>,
}

/// The complete rule set used by the extractors.
pub struct FieldRules {
    header_rules: Vec<(HeaderField, FieldRule)>,
    origin_code: Vec<FieldRule>,
    reference_number: FieldRule,
}

impl FieldRules {
    /// Rules for the known document and message conventions.
    pub fn default_rules() -> Self {
        let text = |label: &str, labels: &str, normalize: Normalize| {
            FieldRule::new(label, &format!(r"(?im)\b(?:{labels}){TEXT_WINDOW}"), normalize).unwrap()
        };

        let header_rules = vec![
            (
                HeaderField::TaxId,
                FieldRule::new(
                    "RUT / Tax ID",
                    r"(?i)\b(?:R\.?\s?U\.?\s?T\.?|Tax\s*ID)\s*(?:N[°º]\s*)?[:.]?\s*(\d{1,2}\.?\d{3}\.?\d{3}\s*-\s*[\dkK])",
                    Normalize::Trim,
                )
                .unwrap(),
            ),
            (
                HeaderField::LegalName,
                text("Razón Social", r"Raz[oó]n\s+Social|Legal\s+Name", Normalize::Trim),
            ),
            (
                HeaderField::Address,
                text(
                    "Dirección",
                    r"Direcci[oó]n(?:\s+de\s+(?:despacho|entrega))?|Shipping\s+Address|Address",
                    Normalize::Trim,
                ),
            ),
            (
                HeaderField::District,
                text("Comuna", r"Comuna|District", Normalize::Trim),
            ),
            (
                HeaderField::ShipmentType,
                text(
                    "Tipo de despacho",
                    r"Tipo\s+de\s+(?:despacho|env[ií]o)|Shipment\s+Type",
                    Normalize::Trim,
                )
                .with_default("DESPACHO"),
            ),
            (
                HeaderField::Carrier,
                text("Transporte", r"Transportista|Transporte|Carrier", Normalize::Trim),
            ),
        ];

        let origin_code = vec![
            FieldRule::new(
                "Orden de Compra",
                r"(?i)\b(?:Orden\s+de\s+Compra|Purchase\s+Order|OC|PO)\s*(?:N[°º]|No\.?|#)?\s*[:.]?\s*([A-Za-z0-9][A-Za-z0-9/_-]*\d[A-Za-z0-9/_-]*)",
                Normalize::Upper,
            )
            .unwrap(),
            // Bare "OC-1234" tokens without a preceding label.
            FieldRule::new(
                "OC token",
                r"(?i)\b((?:OC|PO)-[A-Za-z0-9]*\d[A-Za-z0-9-]*)",
                Normalize::Upper,
            )
            .unwrap(),
        ];

        let reference_number = FieldRule::new(
            "N° de confirmación",
            r"(?i)(?:N[°º]\s*(?:de\s+)?(?:confirmaci[oó]n|referencia)|Nota\s+de\s+Venta|Confirmation\s+(?:No\.?|Number|#)|Reference\s+(?:No\.?|Number|#))\s*[:.#]?\s*(\S+)",
            Normalize::Trim,
        )
        .unwrap()
        .numeric();

        Self {
            header_rules,
            origin_code,
            reference_number,
        }
    }

    /// Add a header rule. Earlier rules win when both match.
    pub fn add_header_rule(
        &mut self,
        field: HeaderField,
        pattern: &str,
        default: Option<&str>,
    ) -> Result<(), regex::Error> {
        let mut rule = FieldRule::new(field.name(), pattern, Normalize::Trim)?;
        rule.default = default.map(str::to_string);
        self.header_rules.push((field, rule));
        Ok(())
    }

    /// Extract header fields from the given sources, in priority order.
    pub fn extract_header(&self, sources: &[&str]) -> HeaderExtraction {
        let mut extraction = HeaderExtraction::default();
        let fields = [
            HeaderField::TaxId,
            HeaderField::LegalName,
            HeaderField::Address,
            HeaderField::District,
            HeaderField::ShipmentType,
            HeaderField::Carrier,
        ];

        for field in fields {
            let rules: Vec<&FieldRule> = self
                .header_rules
                .iter()
                .filter(|(f, _)| *f == field)
                .map(|(_, r)| r)
                .collect();

            let captured = sources
                .iter()
                .find_map(|text| rules.iter().find_map(|rule| rule.capture(text)))
                .or_else(|| rules.iter().find_map(|rule| rule.default.clone()));

            match captured {
                Some(value) => *field.slot(&mut extraction.header) = value,
                None if field.required() => {
                    extraction.advisories.push(Advisory::field_missing(field.name()))
                }
                None => {}
            }
        }

        extraction
    }

    /// Origin code from the first source that carries one.
    pub fn origin_code(&self, sources: &[&str]) -> Option<String> {
        sources
            .iter()
            .find_map(|text| self.origin_code.iter().find_map(|rule| rule.capture(text)))
            .map(|code| code.trim_matches(['-', '/', '_']).to_string())
            .filter(|code| !code.is_empty())
    }

    /// Internal reference number. Only ever pass the covering message body.
    pub fn reference_number(&self, body: &str) -> Option<String> {
        self.reference_number.capture(body)
    }
}

/// Normalize extracted text before rules run: unified line endings,
/// non-breaking spaces folded, trailing whitespace removed.
pub fn normalize_text(raw: &str) -> String {
    raw.replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace(['\u{a0}', '\u{202f}'], " ")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::AdvisoryKind;

    const DOC: &str = "ORDEN DE COMPRA N° 4500012345\n\
Razón Social: Comercial Andes SpA      RUT: 77.337.586-0\n\
Dirección de despacho: Av. Providencia 1234, of. 5\n\
Comuna: Providencia\n\
Tipo de despacho: retiro en bodega\n\
Transporte: Starken\n";

    #[test]
    fn header_fields_from_document() {
        let rules = FieldRules::default_rules();
        let text = normalize_text(DOC);
        let out = rules.extract_header(&[&text]);
        assert_eq!(out.header.tax_id, "77.337.586-0");
        assert_eq!(out.header.legal_name, "Comercial Andes SpA");
        assert_eq!(out.header.address, "Av. Providencia 1234, of. 5");
        assert_eq!(out.header.district, "Providencia");
        assert_eq!(out.header.shipment_type, "retiro en bodega");
        assert_eq!(out.header.carrier, "Starken");
        assert!(out.advisories.is_empty());
    }

    #[test]
    fn missing_required_fields_become_advisories() {
        let rules = FieldRules::default_rules();
        let out = rules.extract_header(&["Comuna: Ñuñoa"]);
        assert_eq!(out.header.district, "Ñuñoa");
        assert_eq!(out.header.shipment_type, "DESPACHO");
        let missing: Vec<_> = out
            .advisories
            .iter()
            .filter(|a| a.kind == AdvisoryKind::FieldMissing)
            .collect();
        assert_eq!(missing.len(), 2);
        assert_eq!(missing[0].message, "Required field missing: tax_id");
    }

    #[test]
    fn header_values_keep_their_case() {
        let rules = FieldRules::default_rules();
        let out = rules.extract_header(&["RUT: 12.345.678-k\nTipo de envío: Retiro en Tienda"]);
        assert_eq!(out.header.tax_id, "12.345.678-k");
        assert_eq!(out.header.shipment_type, "Retiro en Tienda");
    }

    #[test]
    fn body_is_a_fallback_source() {
        let rules = FieldRules::default_rules();
        let out = rules.extract_header(&["nothing here", "RUT: 77337586-0"]);
        assert_eq!(out.header.tax_id, "77337586-0");
    }

    #[test]
    fn origin_code_prefers_first_source() {
        let rules = FieldRules::default_rules();
        assert_eq!(
            rules.origin_code(&["Orden de Compra OC-12345 confirmada", "OC 999"]),
            Some("OC-12345".into())
        );
        assert_eq!(
            rules.origin_code(&["sin código", "Purchase Order #PO7788"]),
            Some("PO7788".into())
        );
        assert_eq!(
            rules.origin_code(&["Re: OC-777 confirmada"]),
            Some("OC-777".into())
        );
        assert_eq!(rules.origin_code(&["no code at all"]), None);
    }

    #[test]
    fn reference_number_must_be_numeric() {
        let rules = FieldRules::default_rules();
        assert_eq!(
            rules.reference_number("Su N° de confirmación: 88123."),
            Some("88123".into())
        );
        assert_eq!(rules.reference_number("Nota de Venta: OC-12345"), None);
        assert_eq!(rules.reference_number("no reference"), None);
    }

    #[test]
    fn numeric_rule_skips_to_next_match() {
        let rules = FieldRules::default_rules();
        let body = "Nota de Venta: OC-12345\nN° de confirmación: 4471";
        assert_eq!(rules.reference_number(body), Some("4471".into()));
    }

    #[test]
    fn custom_header_rule() {
        let mut rules = FieldRules::default_rules();
        rules
            .add_header_rule(HeaderField::Carrier, r"(?im)^Courier:\s*(.+)$", None)
            .unwrap();
        let out = rules.extract_header(&["Courier: Chilexpress"]);
        assert_eq!(out.header.carrier, "Chilexpress");
    }

    #[test]
    fn normalize_text_folds_line_endings() {
        assert_eq!(normalize_text("a\u{a0}b  \r\nc\r"), "a b\nc");
    }
}
