//! Product table detection shared by the document backends.
//!
//! A qualifying table has a header row naming a product code column, a
//! quantity column and a unit price column. Each header cell is mapped to a
//! column role; the rows that follow are parsed by role until the table ends.

use rust_decimal::Decimal;
use tracing::debug;

use crate::documents::numbers::{NumberLocale, parse_amount, parse_quantity};
use crate::pipeline::types::ExtractedLineItem;

/// What a table column holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Sku,
    Description,
    Quantity,
    UnitPrice,
    /// Line total or anything else; ignored.
    Other,
}

const SKU_KEYWORDS: &[&str] = &["sku", "código", "codigo", "cód", "cod.", "item code", "product code", "part"];
const DESCRIPTION_KEYWORDS: &[&str] = &["descripción", "descripcion", "description", "producto", "product", "detalle"];
const QUANTITY_KEYWORDS: &[&str] = &["cantidad", "cant", "qty", "quantity", "unidades", "units"];
const PRICE_KEYWORDS: &[&str] = &["precio", "price", "valor unit", "p. unit", "unit"];
const TOTAL_KEYWORDS: &[&str] = &["total", "subtotal", "importe", "amount", "monto"];

/// Infer the role of a header cell (case-insensitive).
pub fn infer_role(cell: &str) -> ColumnRole {
    let lower = cell.trim().to_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| lower.contains(k));

    // "Precio Total" is a line total, "Total" alone too.
    if has(TOTAL_KEYWORDS) && !lower.contains("unit") {
        return ColumnRole::Other;
    }
    if has(SKU_KEYWORDS) {
        ColumnRole::Sku
    } else if has(QUANTITY_KEYWORDS) {
        ColumnRole::Quantity
    } else if has(PRICE_KEYWORDS) {
        ColumnRole::UnitPrice
    } else if has(DESCRIPTION_KEYWORDS) {
        ColumnRole::Description
    } else {
        ColumnRole::Other
    }
}

/// Column layout of a detected table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub roles: Vec<ColumnRole>,
}

impl TableLayout {
    /// Build a layout from header cells; `None` if the row is not a product table header.
    ///
    /// When no dedicated SKU column exists, a "Producto" column stands in for it.
    pub fn from_header<S: AsRef<str>>(cells: &[S]) -> Option<Self> {
        let mut roles: Vec<ColumnRole> = cells.iter().map(|c| infer_role(c.as_ref())).collect();

        if !roles.contains(&ColumnRole::Sku)
            && let Some(pos) = roles.iter().position(|r| *r == ColumnRole::Description)
        {
            roles[pos] = ColumnRole::Sku;
        }

        let qualifies = roles.contains(&ColumnRole::Sku)
            && roles.contains(&ColumnRole::Quantity)
            && roles.contains(&ColumnRole::UnitPrice);
        qualifies.then_some(Self { roles })
    }

    fn index(&self, role: ColumnRole) -> Option<usize> {
        self.roles.iter().position(|r| *r == role)
    }

    /// Parse one data row. `None` when the row is not a product line.
    pub fn parse_row<S: AsRef<str>>(&self, cells: &[S], locale: NumberLocale) -> Option<ExtractedLineItem> {
        let cell = |role: ColumnRole| {
            self.index(role)
                .and_then(|i| cells.get(i))
                .map(|c| c.as_ref().trim())
        };

        let sku = cell(ColumnRole::Sku).filter(|s| !s.is_empty())?;
        if TOTAL_KEYWORDS.iter().any(|k| sku.to_lowercase().starts_with(k)) {
            return None;
        }
        let quantity = parse_quantity(cell(ColumnRole::Quantity)?, locale)?;
        let unit_price: Decimal = parse_amount(cell(ColumnRole::UnitPrice)?, locale)?;
        let description = cell(ColumnRole::Description).unwrap_or_default().to_string();

        Some(ExtractedLineItem {
            sku: sku.to_string(),
            description,
            quantity,
            unit_price,
        })
    }
}

/// Non-product rows tolerated in a row before the table is considered over.
const MAX_STRAY_ROWS: usize = 5;

/// Parse the data rows that follow a table header.
///
/// Empty rows, page furniture and a header repeated on a new page are
/// skipped. The table ends at a totals row or after `MAX_STRAY_ROWS`
/// consecutive rows that are not product lines.
pub fn collect_rows<I>(layout: &TableLayout, rows: I, locale: NumberLocale) -> Vec<ExtractedLineItem>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut items = Vec::new();
    let mut stray = 0usize;

    for cells in rows {
        let Some(first) = cells.iter().map(|c| c.trim()).find(|c| !c.is_empty()) else {
            continue;
        };
        let lower = first.to_lowercase();
        if TOTAL_KEYWORDS.iter().any(|k| lower.starts_with(k)) {
            debug!(row = %first, "Table ends at totals row");
            break;
        }
        if TableLayout::from_header(&cells).is_some() {
            continue;
        }

        match layout.parse_row(&cells, locale) {
            Some(item) => {
                items.push(item);
                stray = 0;
            }
            None => {
                debug!(row = ?cells, "Skipping non-product row");
                stray += 1;
                if stray >= MAX_STRAY_ROWS {
                    debug!(items = items.len(), "Table ends after stray rows");
                    break;
                }
            }
        }
    }
    items
}
