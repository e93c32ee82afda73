//! Legacy HTML table extractor using the `scraper` crate.
//!
//! Older notifications carried the order inline as an HTML body with the
//! product lines in a table with a fixed id. Only used for messages without
//! an attachment.

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::documents::numbers::NumberLocale;
use crate::documents::table::{TableLayout, collect_rows};
use crate::documents::{DocumentExtractor, ExtractedDocument, PayloadKind};
use crate::error::ExtractionError;
use crate::pipeline::rules::{FieldRules, normalize_text};
use crate::pipeline::types::ExtractedLineItem;

/// Id of the product table in legacy notifications.
pub const ORDER_TABLE_ID: &str = "detalle";

/// Fallback backend for HTML bodies.
pub struct HtmlTableExtractor {
    locale: NumberLocale,
}

impl HtmlTableExtractor {
    pub fn new(locale: NumberLocale) -> Self {
        Self { locale }
    }

    fn parse_table(&self, table: ElementRef<'_>, rows: &Selector, cells: &Selector) -> Vec<ExtractedLineItem> {
        let mut texts = table.select(rows).map(|row| row_cells(row, cells));
        match texts.by_ref().find_map(|header| TableLayout::from_header(&header)) {
            Some(layout) => collect_rows(&layout, texts, self.locale),
            None => {
                debug!("Order table has no product header row");
                Vec::new()
            }
        }
    }
}

fn selector(css: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|e| ExtractionError::Parse {
        format: "html".into(),
        message: format!("selector {css}: {e}"),
    })
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn row_cells(row: ElementRef<'_>, cells: &Selector) -> Vec<String> {
    row.select(cells).map(element_text).collect()
}

impl DocumentExtractor for HtmlTableExtractor {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Html
    }

    fn extract(&self, payload: &[u8], rules: &FieldRules) -> Result<ExtractedDocument, ExtractionError> {
        let html = String::from_utf8_lossy(payload);
        let document = Html::parse_document(&html);

        let rows = selector("tr")?;
        let cells = selector("th, td")?;
        let blocks = selector("p, li, h1, h2, h3, h4, h5, h6")?;
        let table_sel = selector(&format!("table#{ORDER_TABLE_ID}"))?;

        // Table rows become lines with cells separated by column gaps, so the
        // label rules see "RUT:  77.337.586-0" the same way as in PDF text.
        let mut lines: Vec<String> = document
            .select(&blocks)
            .map(element_text)
            .filter(|l| !l.is_empty())
            .collect();
        lines.extend(
            document
                .select(&rows)
                .map(|row| row_cells(row, &cells).join("  "))
                .filter(|l| !l.is_empty()),
        );
        let text = normalize_text(&lines.join("\n"));

        let line_items = match document.select(&table_sel).next() {
            Some(table) => self.parse_table(table, &rows, &cells),
            None => {
                debug!(table_id = ORDER_TABLE_ID, "Order table not present in HTML body");
                Vec::new()
            }
        };

        let extraction = rules.extract_header(&[&text]);
        Ok(ExtractedDocument {
            header: extraction.header,
            advisories: extraction.advisories,
            line_items,
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    const BODY: &str = r#"<html><body>
<p>Orden de Compra N° 4500012345</p>
<table id="cliente">
  <tr><td>RUT:</td><td>77.337.586-0</td></tr>
  <tr><td>Razón Social:</td><td>Comercial Andes SpA</td></tr>
  <tr><td>Comuna:</td><td>Maipú</td></tr>
</table>
<table id="detalle">
  <tr><th>SKU</th><th>Descripción</th><th>Cantidad</th><th>Precio</th></tr>
  <tr><td>ABC123</td><td>Tornillo</td><td>2</td><td>$1.000</td></tr>
  <tr><td>def456</td><td>Tuerca</td><td>5</td><td>$200</td></tr>
  <tr><td>Total</td><td></td><td></td><td>$3.000</td></tr>
</table>
</body></html>"#;

    #[test]
    fn extracts_fixed_table_and_header() {
        let extractor = HtmlTableExtractor::new(NumberLocale::DotThousands);
        let doc = extractor
            .extract(BODY.as_bytes(), &FieldRules::default_rules())
            .unwrap();
        assert_eq!(doc.header.tax_id, "77.337.586-0");
        assert_eq!(doc.header.legal_name, "Comercial Andes SpA");
        assert_eq!(doc.header.district, "Maipú");
        assert_eq!(doc.line_items.len(), 2);
        assert_eq!(doc.line_items[0].quantity, 2);
        assert_eq!(doc.line_items[0].unit_price, dec!(1000));
        assert_eq!(doc.line_items[1].sku, "def456");
    }

    #[test]
    fn other_tables_are_ignored() {
        let html = r#"<table id="otra"><tr><th>SKU</th><th>Cantidad</th><th>Precio</th></tr>
<tr><td>A1</td><td>1</td><td>10</td></tr></table>"#;
        let extractor = HtmlTableExtractor::new(NumberLocale::DotThousands);
        let doc = extractor
            .extract(html.as_bytes(), &FieldRules::default_rules())
            .unwrap();
        assert!(doc.line_items.is_empty());
    }
}
