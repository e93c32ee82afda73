//! PDF table extractor built on `pdf-extract`.
//!
//! Glyphs are collected with their page coordinates through an `OutputDev`,
//! then grouped into lines by baseline and into words by horizontal gaps.
//! The product table header fixes one x band per column and the words of
//! every following line are assigned to bands by position, so narrow column
//! gaps and the vertical spacing between rows do not affect parsing. Rows
//! continue across page breaks.

use std::panic::{AssertUnwindSafe, catch_unwind};

use pdf_extract::{Document, MediaBox, OutputDev, OutputError, Transform};
use tracing::{debug, warn};

use crate::documents::numbers::NumberLocale;
use crate::documents::table::{TableLayout, collect_rows};
use crate::documents::{DocumentExtractor, ExtractedDocument, PayloadKind};
use crate::error::ExtractionError;
use crate::pipeline::rules::{FieldRules, normalize_text};
use crate::pipeline::types::ExtractedLineItem;

/// Glyphs closer than this fraction of the font size join one word.
const WORD_GAP: f64 = 0.15;
/// Words closer than this many font sizes join one cell.
const CELL_GAP: f64 = 1.0;
/// Baselines within this fraction of the font size share a line.
const LINE_TOLERANCE: f64 = 0.5;

/// One rendered glyph. `y` grows downwards from the top of the page.
#[derive(Debug, Clone)]
struct Glyph {
    page: u32,
    x: f64,
    end: f64,
    y: f64,
    size: f64,
    text: String,
}

/// Records every glyph `pdf-extract` renders.
#[derive(Default)]
struct GlyphCollector {
    page: u32,
    top: f64,
    glyphs: Vec<Glyph>,
}

impl OutputDev for GlyphCollector {
    fn begin_page(
        &mut self,
        page_num: u32,
        media_box: &MediaBox,
        _art_box: Option<(f64, f64, f64, f64)>,
    ) -> Result<(), OutputError> {
        self.page = page_num;
        self.top = media_box.ury;
        Ok(())
    }

    fn end_page(&mut self) -> Result<(), OutputError> {
        Ok(())
    }

    fn output_character(
        &mut self,
        trm: &Transform,
        width: f64,
        _spacing: f64,
        font_size: f64,
        char: &str,
    ) -> Result<(), OutputError> {
        let scale = (trm.m11 * trm.m22 - trm.m12 * trm.m21).abs().sqrt();
        let size = (font_size * scale).abs().max(1.0);
        self.glyphs.push(Glyph {
            page: self.page,
            x: trm.m31,
            end: trm.m31 + width * size,
            y: self.top - trm.m32,
            size,
            text: char.to_string(),
        });
        Ok(())
    }

    fn begin_word(&mut self) -> Result<(), OutputError> {
        Ok(())
    }

    fn end_word(&mut self) -> Result<(), OutputError> {
        Ok(())
    }

    fn end_line(&mut self) -> Result<(), OutputError> {
        Ok(())
    }
}

/// A run of glyphs and its horizontal extent.
#[derive(Debug, Clone, PartialEq)]
struct Word {
    text: String,
    x0: f64,
    x1: f64,
}

impl Word {
    fn center(&self) -> f64 {
        (self.x0 + self.x1) / 2.0
    }
}

/// One visual line, words left to right.
#[derive(Debug, Clone, PartialEq)]
struct TextLine {
    page: u32,
    size: f64,
    words: Vec<Word>,
}

impl TextLine {
    /// Words merged where the gap is under `CELL_GAP` font sizes.
    fn cells(&self) -> Vec<Word> {
        let mut cells: Vec<Word> = Vec::new();
        for word in &self.words {
            match cells.last_mut() {
                Some(cell) if word.x0 - cell.x1 < self.size * CELL_GAP => {
                    cell.text.push(' ');
                    cell.text.push_str(&word.text);
                    cell.x1 = cell.x1.max(word.x1);
                }
                _ => cells.push(word.clone()),
            }
        }
        cells
    }

    /// Cells joined by two spaces, so label rules stop at column gaps.
    fn text(&self) -> String {
        self.cells()
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("  ")
    }
}

fn same_line(a: &Glyph, b: &Glyph) -> bool {
    a.page == b.page && (a.y - b.y).abs() <= a.size.max(b.size) * LINE_TOLERANCE
}

/// Group glyphs into lines, top to bottom and page by page.
fn lines_from(mut glyphs: Vec<Glyph>) -> Vec<TextLine> {
    glyphs.sort_by(|a, b| a.page.cmp(&b.page).then(a.y.total_cmp(&b.y)));

    let mut rows: Vec<Vec<Glyph>> = Vec::new();
    for glyph in glyphs {
        match rows.last_mut() {
            Some(row) if row.first().is_some_and(|first| same_line(first, &glyph)) => row.push(glyph),
            _ => rows.push(vec![glyph]),
        }
    }
    rows.into_iter().filter_map(line_from).collect()
}

fn line_from(mut glyphs: Vec<Glyph>) -> Option<TextLine> {
    glyphs.sort_by(|a, b| a.x.total_cmp(&b.x));
    let page = glyphs.first()?.page;
    let size = glyphs.iter().map(|g| g.size).fold(1.0, f64::max);

    let mut words: Vec<Word> = Vec::new();
    let mut open = false;
    for glyph in glyphs {
        if glyph.text.trim().is_empty() {
            open = false;
            continue;
        }
        match words.last_mut() {
            Some(word) if open && glyph.x - word.x1 <= size * WORD_GAP => {
                word.text.push_str(&glyph.text);
                word.x1 = word.x1.max(glyph.end);
            }
            _ => words.push(Word {
                text: glyph.text,
                x0: glyph.x,
                x1: glyph.end,
            }),
        }
        open = true;
    }

    (!words.is_empty()).then_some(TextLine { page, size, words })
}

/// Words of a line joined per column band. `bounds` holds the right edge of
/// every band but the last.
fn assign_columns(line: &TextLine, bounds: &[f64]) -> Vec<String> {
    let mut cells = vec![String::new(); bounds.len() + 1];
    for word in &line.words {
        let column = bounds.iter().take_while(|b| word.center() >= **b).count();
        if let Some(cell) = cells.get_mut(column) {
            if !cell.is_empty() {
                cell.push(' ');
            }
            cell.push_str(&word.text);
        }
    }
    cells
}

/// Locate the product table header and parse the rows below it.
fn find_table(lines: &[TextLine], locale: NumberLocale) -> Vec<ExtractedLineItem> {
    for (i, line) in lines.iter().enumerate() {
        let header = line.cells();
        let names: Vec<&str> = header.iter().map(|c| c.text.as_str()).collect();
        let Some(layout) = TableLayout::from_header(&names) else {
            continue;
        };

        // Each column owns the x range up to the middle of the gap to the next one.
        let bounds: Vec<f64> = header
            .windows(2)
            .map(|pair| (pair[0].x1 + pair[1].x0) / 2.0)
            .collect();
        debug!(page = line.page, columns = ?names, "Product table header found");

        let rows = lines[i + 1..].iter().map(|row| assign_columns(row, &bounds));
        return collect_rows(&layout, rows, locale);
    }

    debug!("No product table header found");
    Vec::new()
}

fn parse_error(message: impl Into<String>) -> ExtractionError {
    ExtractionError::Parse {
        format: "pdf".into(),
        message: message.into(),
    }
}

/// Primary, authoritative backend.
pub struct PdfTableExtractor {
    locale: NumberLocale,
}

impl PdfTableExtractor {
    pub fn new(locale: NumberLocale) -> Self {
        Self { locale }
    }

    fn extract_lines(&self, lines: &[TextLine], rules: &FieldRules) -> ExtractedDocument {
        let text = normalize_text(&lines.iter().map(TextLine::text).collect::<Vec<_>>().join("\n"));
        let line_items = find_table(lines, self.locale);
        let extraction = rules.extract_header(&[&text]);

        debug!(
            lines = lines.len(),
            items = line_items.len(),
            tax_id = %extraction.header.tax_id,
            "PDF document extracted"
        );

        ExtractedDocument {
            header: extraction.header,
            advisories: extraction.advisories,
            line_items,
            text,
        }
    }
}

impl DocumentExtractor for PdfTableExtractor {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Pdf
    }

    fn extract(&self, payload: &[u8], rules: &FieldRules) -> Result<ExtractedDocument, ExtractionError> {
        let document = Document::load_mem(payload).map_err(|e| parse_error(e.to_string()))?;
        if document.is_encrypted() {
            return Err(parse_error("document is encrypted"));
        }

        // Font program parsing inside pdf-extract can panic on damaged files.
        let mut collector = GlyphCollector::default();
        let rendered = catch_unwind(AssertUnwindSafe(|| {
            pdf_extract::output_doc(&document, &mut collector)
        }));
        match rendered {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(parse_error(e.to_string())),
            Err(_) => {
                warn!("PDF renderer panicked");
                return Err(parse_error("document could not be rendered"));
            }
        }

        let lines = lines_from(collector.glyphs);
        if lines.is_empty() {
            return Err(parse_error("document has no text layer"));
        }
        Ok(self.extract_lines(&lines, rules))
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    /// PDF with one page per entry, each `(x, y, text)` drawn in 10pt Helvetica.
    fn pdf(pages: &[&[(f64, f64, &str)]]) -> Vec<u8> {
        let kids: Vec<String> = (0..pages.len()).map(|i| format!("{} 0 R", 4 + 2 * i)).collect();
        let mut objects = vec![
            "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
            format!("<< /Type /Pages /Kids [{}] /Count {} >>", kids.join(" "), pages.len()),
            "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
        ];
        for (i, runs) in pages.iter().enumerate() {
            let content: String = runs
                .iter()
                .map(|(x, y, text)| format!("BT /F1 10 Tf {x} {y} Td ({text}) Tj ET\n"))
                .collect();
            objects.push(format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
/Resources << /Font << /F1 3 0 R >> >> /Contents {} 0 R >>",
                5 + 2 * i
            ));
            objects.push(format!("<< /Length {} >>\nstream\n{content}endstream", content.len()));
        }

        let mut out = String::from("%PDF-1.4\n");
        let mut offsets = Vec::new();
        for (i, body) in objects.iter().enumerate() {
            offsets.push(out.len());
            out.push_str(&format!("{} 0 obj\n{body}\nendobj\n", i + 1));
        }
        let xref = out.len();
        out.push_str(&format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1));
        for offset in offsets {
            out.push_str(&format!("{offset:010} 00000 n \n"));
        }
        out.push_str(&format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref}\n%%EOF\n",
            objects.len() + 1
        ));
        out.into_bytes()
    }

    const HEADER: &[(f64, f64, &str)] = &[
        (50.0, 740.0, "ORDEN DE COMPRA OC-4500012345"),
        (50.0, 720.0, "RUT: 77.337.586-0"),
        (50.0, 705.0, "Razon Social: Comercial Andes SpA"),
        (50.0, 660.0, "SKU"),
        (150.0, 660.0, "Descripcion"),
        (300.0, 660.0, "Cantidad"),
        (400.0, 660.0, "Precio"),
    ];

    fn extract(bytes: &[u8]) -> ExtractedDocument {
        PdfTableExtractor::new(NumberLocale::DotThousands)
            .extract(bytes, &FieldRules::default_rules())
            .unwrap()
    }

    #[test]
    fn table_rows_are_split_by_column_position() {
        let mut runs = HEADER.to_vec();
        runs.extend([
            (50.0, 630.0, "ABC123"),
            (150.0, 630.0, "Tornillo 3 mm"),
            (300.0, 630.0, "2"),
            (400.0, 630.0, "1.000"),
            (50.0, 600.0, "XYZ9"),
            (150.0, 600.0, "Tuerca"),
            (300.0, 600.0, "3"),
            (400.0, 600.0, "500"),
        ]);
        let doc = extract(&pdf(&[runs.as_slice()]));

        assert_eq!(doc.header.tax_id, "77.337.586-0");
        assert_eq!(doc.header.legal_name, "Comercial Andes SpA");
        assert!(doc.advisories.is_empty(), "{:?}", doc.advisories);
        assert_eq!(doc.line_items.len(), 2);
        assert_eq!(doc.line_items[0].sku, "ABC123");
        assert_eq!(doc.line_items[0].description, "Tornillo 3 mm");
        assert_eq!(doc.line_items[0].quantity, 2);
        assert_eq!(doc.line_items[0].unit_price, dec!(1000));
        assert_eq!(doc.line_items[1].sku, "XYZ9");
        assert_eq!(doc.line_items[1].unit_price, dec!(500));
    }

    #[test]
    fn table_continues_on_next_page_and_stops_at_totals() {
        let mut first = HEADER.to_vec();
        first.extend([
            (50.0, 630.0, "A1"),
            (150.0, 630.0, "Uno"),
            (300.0, 630.0, "1"),
            (400.0, 630.0, "100"),
            (250.0, 40.0, "Pagina 1 de 2"),
        ]);
        let second = [
            (50.0, 740.0, "SKU"),
            (150.0, 740.0, "Descripcion"),
            (300.0, 740.0, "Cantidad"),
            (400.0, 740.0, "Precio"),
            (50.0, 710.0, "A2"),
            (150.0, 710.0, "Dos"),
            (300.0, 710.0, "2"),
            (400.0, 710.0, "200"),
            (150.0, 680.0, "Total"),
            (400.0, 680.0, "500"),
            (50.0, 650.0, "A3"),
            (150.0, 650.0, "Fuera"),
            (300.0, 650.0, "9"),
            (400.0, 650.0, "9"),
        ];
        let doc = extract(&pdf(&[first.as_slice(), second.as_slice()]));

        let skus: Vec<&str> = doc.line_items.iter().map(|i| i.sku.as_str()).collect();
        assert_eq!(skus, ["A1", "A2"]);
    }

    #[test]
    fn lines_group_by_baseline_and_words_by_gap() {
        let glyph = |x: f64, y: f64, text: &str| Glyph {
            page: 1,
            x,
            end: x + 5.0,
            y,
            size: 10.0,
            text: text.into(),
        };
        let lines = lines_from(vec![
            glyph(60.0, 100.0, "B"),
            glyph(150.0, 100.4, "Z"),
            glyph(50.0, 100.0, "A"),
            glyph(55.0, 100.0, " "),
            glyph(50.0, 120.0, "C"),
        ]);
        assert_eq!(lines.len(), 2);
        let words: Vec<&str> = lines[0].words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(words, ["A", "B", "Z"]);
        assert_eq!(lines[0].text(), "A B  Z");
        assert_eq!(assign_columns(&lines[0], &[100.0]), vec!["A B", "Z"]);
    }

    #[test]
    fn page_without_table_has_no_items() {
        let runs = [(50.0, 700.0, "RUT: 77337586-0"), (50.0, 680.0, "Gracias")];
        let doc = extract(&pdf(&[runs.as_slice()]));
        assert!(doc.line_items.is_empty());
        assert_eq!(doc.header.tax_id, "77337586-0");
    }

    #[test]
    fn non_pdf_bytes_are_a_parse_error() {
        let extractor = PdfTableExtractor::new(NumberLocale::default());
        let result = extractor.extract(b"This is not a PDF", &FieldRules::default_rules());
        assert!(matches!(result, Err(ExtractionError::Parse { .. })));
    }

    #[test]
    fn empty_page_has_no_text_layer() {
        let extractor = PdfTableExtractor::new(NumberLocale::default());
        let blank: &[(f64, f64, &str)] = &[];
        let result = extractor.extract(&pdf(&[blank]), &FieldRules::default_rules());
        assert!(matches!(result, Err(ExtractionError::Parse { message, .. }) if message.contains("text layer")));
    }
}
