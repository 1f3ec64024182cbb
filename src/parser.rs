// 🏗️ Report Parser - bytes → header layout + typed raw rows
// Workbooks (xlsx/xls/ods) go through calamine, everything else is treated
// as a delimited text export.

use crate::columns::{is_header_row, Column, SheetLayout};
use crate::config::IngestConfig;
use crate::error::ParseError;
use crate::normalize::excel_serial_to_datetime;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

// ============================================================================
// CORE TYPES
// ============================================================================

/// One non-blank spreadsheet cell as the decoder saw it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl CellValue {
    /// Header-style rendering of the cell
    pub fn as_label(&self) -> String {
        match self {
            CellValue::Text(s) => s.clone(),
            CellValue::Integer(i) => i.to_string(),
            CellValue::Float(f) => f.to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Date(d) => d.format("%d.%m.%Y").to_string(),
            CellValue::DateTime(dt) => dt.format("%d.%m.%Y %H:%M:%S").to_string(),
        }
    }
}

fn text_cell(raw: &str) -> Option<CellValue> {
    if raw.trim().is_empty() {
        None
    } else {
        Some(CellValue::Text(raw.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactFormat {
    /// xlsx / ods (zip container) or legacy xls (OLE2 container)
    Workbook,
    /// csv / tsv text export
    Delimited,
}

impl ArtifactFormat {
    pub fn detect(content: &[u8]) -> Self {
        const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
        const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];

        if content.starts_with(ZIP_MAGIC) || content.starts_with(OLE_MAGIC) {
            ArtifactFormat::Workbook
        } else {
            ArtifactFormat::Delimited
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Workbook => "xlsx",
            ArtifactFormat::Delimited => "csv",
        }
    }
}

/// Decoded grid: (1-based source line, cells)
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub rows: Vec<(usize, Vec<Option<CellValue>>)>,
}

/// One data row with every report column as a named optional cell
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    pub line: usize,
    pub tax_id: Option<CellValue>,
    pub enterprise_name: Option<CellValue>,
    pub address: Option<CellValue>,
    pub district: Option<CellValue>,
    pub category: Option<CellValue>,
    pub business_plan_category: Option<CellValue>,
    pub contract_number: Option<CellValue>,
    pub contract_date: Option<CellValue>,
    pub termination_date: Option<CellValue>,
    pub debt_origin_date: Option<CellValue>,
    pub receivables_total: Option<CellValue>,
    pub receivables_acts: Option<CellValue>,
    pub receivables_current: Option<CellValue>,
    pub receivables_overdue: Option<CellValue>,
    pub payables_total: Option<CellValue>,
}

impl RawRow {
    /// Build a row from positional cells. Spacer and totals rows (nothing
    /// identifying in them) yield `None`.
    pub fn from_cells(line: usize, cells: &[Option<CellValue>], layout: &SheetLayout) -> Option<Self> {
        let cell = |column: Column| {
            layout
                .index(column)
                .and_then(|i| cells.get(i))
                .cloned()
                .flatten()
        };

        let row = RawRow {
            line,
            tax_id: cell(Column::TaxId),
            enterprise_name: cell(Column::EnterpriseName),
            address: cell(Column::Address),
            district: cell(Column::District),
            category: cell(Column::Category),
            business_plan_category: cell(Column::BusinessPlanCategory),
            contract_number: cell(Column::ContractNumber),
            contract_date: cell(Column::ContractDate),
            termination_date: cell(Column::TerminationDate),
            debt_origin_date: cell(Column::DebtOriginDate),
            receivables_total: cell(Column::ReceivablesTotal),
            receivables_acts: cell(Column::ReceivablesActs),
            receivables_current: cell(Column::ReceivablesCurrent),
            receivables_overdue: cell(Column::ReceivablesOverdue),
            payables_total: cell(Column::PayablesTotal),
        };

        let identifying = [
            &row.tax_id,
            &row.enterprise_name,
            &row.address,
            &row.contract_number,
        ];
        if identifying.iter().all(|c| c.is_none()) {
            return None;
        }
        Some(row)
    }
}

/// Layout plus data rows of one artifact
#[derive(Debug, Clone)]
pub struct ParsedSheet {
    pub format: ArtifactFormat,
    pub layout: SheetLayout,
    pub rows: Vec<RawRow>,
}

// ============================================================================
// DECODING
// ============================================================================

/// Decode the first sheet or the text export. `search_rows` bounds how far
/// down a text export is scanned for its header when sniffing the delimiter.
pub fn decode_table(content: &[u8], search_rows: usize) -> Result<RawTable, ParseError> {
    match ArtifactFormat::detect(content) {
        ArtifactFormat::Workbook => decode_workbook(content),
        ArtifactFormat::Delimited => decode_delimited(content, search_rows),
    }
}

fn decode_workbook(content: &[u8]) -> Result<RawTable, ParseError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(content.to_vec()))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(ParseError::EmptyTable)?;
    let range = workbook.worksheet_range(&sheet)?;

    // Range indices are relative to its first used cell
    let first_row = range.start().map(|(row, _)| row as usize).unwrap_or(0);

    let rows = range
        .rows()
        .enumerate()
        .map(|(idx, cells)| {
            let cells = cells.iter().map(workbook_cell).collect();
            (first_row + idx + 1, cells)
        })
        .collect();

    Ok(RawTable { rows })
}

fn workbook_cell(cell: &Data) -> Option<CellValue> {
    match cell {
        Data::String(s) | Data::DateTimeIso(s) => text_cell(s),
        Data::Int(i) => Some(CellValue::Integer(*i)),
        Data::Float(f) => Some(CellValue::Float(*f)),
        Data::Bool(b) => Some(CellValue::Bool(*b)),
        Data::DateTime(dt) => excel_serial_to_datetime(dt.as_f64()).map(CellValue::DateTime),
        _ => None,
    }
}

fn decode_delimited(content: &[u8], search_rows: usize) -> Result<RawTable, ParseError> {
    let text = decode_text(content)?;
    let delimiter = sniff_delimiter(&text, search_rows);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let line = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(idx + 1);
        rows.push((line, record.iter().map(text_cell).collect()));
    }

    Ok(RawTable { rows })
}

/// UTF-8 (BOM tolerated) or, failing that, Windows-1251
fn decode_text(content: &[u8]) -> Result<String, ParseError> {
    let content = content.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(content);

    match std::str::from_utf8(content) {
        Ok(text) => Ok(text.to_string()),
        Err(_) => {
            let (text, _, had_errors) = encoding_rs::WINDOWS_1251.decode(content);
            if had_errors {
                return Err(ParseError::Decode(
                    "neither UTF-8 nor Windows-1251 text".to_string(),
                ));
            }
            Ok(text.into_owned())
        }
    }
}

const DELIMITERS: [u8; 3] = [b';', b'\t', b','];

/// The delimiter that splits a header row out of the first `search_rows`
/// lines. Without a recognisable header, the most frequent candidate on the
/// first line that has any wins; `,` otherwise.
fn sniff_delimiter(text: &str, search_rows: usize) -> u8 {
    let lines: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(search_rows)
        .collect();

    let header_split = lines.iter().find_map(|line| {
        DELIMITERS
            .into_iter()
            .filter(|d| line.as_bytes().contains(d))
            .find(|d| {
                let labels: Vec<&str> = line.split(char::from(*d)).map(|l| l.trim_matches('"')).collect();
                is_header_row(&labels)
            })
    });
    if let Some(delimiter) = header_split {
        return delimiter;
    }

    lines
        .iter()
        .find_map(|line| {
            DELIMITERS
                .into_iter()
                .max_by_key(|d| line.bytes().filter(|b| b == d).count())
                .filter(|d| line.as_bytes().contains(d))
        })
        .unwrap_or(b',')
}

// ============================================================================
// ARTIFACT → ROWS
// ============================================================================

fn row_labels(cells: &[Option<CellValue>]) -> Vec<String> {
    cells
        .iter()
        .map(|c| c.as_ref().map(CellValue::as_label).unwrap_or_default())
        .collect()
}

/// Decode the artifact, locate the header row and produce typed raw rows
pub fn parse_artifact(content: &[u8], config: &IngestConfig) -> Result<ParsedSheet, ParseError> {
    if content.is_empty() {
        return Err(ParseError::EmptyTable);
    }
    if content.len() > config.max_upload_bytes {
        return Err(ParseError::TooLarge {
            size: content.len(),
            limit: config.max_upload_bytes,
        });
    }

    let format = ArtifactFormat::detect(content);
    let table = decode_table(content, config.header_search_rows)?;
    if table.rows.is_empty() {
        return Err(ParseError::EmptyTable);
    }

    let header_pos = table
        .rows
        .iter()
        .take(config.header_search_rows)
        .position(|(_, cells)| is_header_row(&row_labels(cells)))
        .ok_or(ParseError::HeaderNotFound(config.header_search_rows))?;

    let headers = row_labels(&table.rows[header_pos].1);
    let layout = SheetLayout::resolve(&headers)?;

    let rows = table
        .rows
        .iter()
        .skip(header_pos + 1 + config.skip_rows_after_header)
        .filter_map(|(line, cells)| RawRow::from_cells(*line, cells, &layout))
        .collect();

    Ok(ParsedSheet {
        format,
        layout,
        rows,
    })
}
