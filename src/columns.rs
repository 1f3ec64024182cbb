// 🧭 Column Resolver - locate report columns, including the date-bearing ones
//
// Two balance columns carry the reporting date inside their label, e.g.
// "Receivables balance {31.05.2025}". Everything else is matched by label.

use crate::error::ParseError;
use chrono::NaiveDate;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static REPORT_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{2}\.\d{2}\.\d{4}").expect("static date pattern"));

pub const RECEIVABLES_PREFIXES: &[&str] = &["Receivables balance", "Дебиторская задолженность"];
pub const PAYABLES_PREFIXES: &[&str] = &["Payables balance", "Кредиторская задолженность"];

// ============================================================================
// DATE-BEARING COLUMNS
// ============================================================================

/// Find the first label starting with `prefix` and pull the `DD.MM.YYYY`
/// date embedded in it.
///
/// Returns `(None, None)` when no label matches and `(Some(label), None)`
/// when the label carries no valid date.
pub fn extract_column<'a, S: AsRef<str>>(
    labels: &'a [S],
    prefix: &str,
) -> (Option<&'a str>, Option<NaiveDate>) {
    match find_prefixed(labels, prefix) {
        Some(index) => {
            let label = labels[index].as_ref();
            (Some(label), report_date(label))
        }
        None => (None, None),
    }
}

/// Strict `DD.MM.YYYY` token anywhere in the label
pub fn report_date(label: &str) -> Option<NaiveDate> {
    let token = REPORT_DATE.find(label)?;
    NaiveDate::parse_from_str(token.as_str(), "%d.%m.%Y").ok()
}

fn find_prefixed<S: AsRef<str>>(labels: &[S], prefix: &str) -> Option<usize> {
    labels
        .iter()
        .position(|label| label.as_ref().trim_start().starts_with(prefix))
}

// ============================================================================
// REPORT LAYOUT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    TaxId,
    EnterpriseName,
    Address,
    District,
    Category,
    BusinessPlanCategory,
    ContractNumber,
    ContractDate,
    TerminationDate,
    DebtOriginDate,
    ReceivablesTotal,
    ReceivablesActs,
    ReceivablesCurrent,
    ReceivablesOverdue,
    PayablesTotal,
}

impl Column {
    /// Columns matched by whole label (case and whitespace insensitive)
    const FIXED: [Column; 10] = [
        Column::TaxId,
        Column::EnterpriseName,
        Column::Address,
        Column::District,
        Column::Category,
        Column::BusinessPlanCategory,
        Column::ContractNumber,
        Column::ContractDate,
        Column::TerminationDate,
        Column::DebtOriginDate,
    ];

    /// Accepted labels: the English export and the legacy Russian report
    pub fn labels(&self) -> &'static [&'static str] {
        match self {
            Column::TaxId => &["Tax ID", "Taxpayer ID", "ИНН"],
            Column::EnterpriseName => &["Enterprise name", "Наименование предприятия"],
            Column::Address => &["Address", "Адрес"],
            Column::District => &["District", "Район"],
            Column::Category => &["Category", "Категория"],
            Column::BusinessPlanCategory => &[
                "Business plan category",
                "Категория по бизнес плану",
                "Категория по бизнес-плану",
            ],
            Column::ContractNumber => &["Contract number", "Contract No", "№ Договора"],
            Column::ContractDate => &["Contract date", "Дата заключения"],
            Column::TerminationDate => &["Termination date", "Дата расторжения"],
            Column::DebtOriginDate => &["Debt origin date", "Дата возникновения задолженности"],
            Column::ReceivablesTotal => RECEIVABLES_PREFIXES,
            Column::ReceivablesActs => &["Including under shortfall acts", "В т.ч. по актам недоучета"],
            Column::ReceivablesCurrent => &["Current (under 30 days)", "текущая"],
            Column::ReceivablesOverdue => &["Overdue", "просроченная"],
            Column::PayablesTotal => PAYABLES_PREFIXES,
        }
    }

    pub fn name(&self) -> &'static str {
        self.labels()[0]
    }
}

fn normalize_label(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn matches_label(header: &str, column: Column) -> bool {
    let header = normalize_label(header);
    column
        .labels()
        .iter()
        .any(|label| normalize_label(label) == header)
}

/// Does this row look like the report header?
pub fn is_header_row<S: AsRef<str>>(cells: &[S]) -> bool {
    cells
        .iter()
        .any(|cell| matches_label(cell.as_ref(), Column::TaxId))
}

/// Column positions resolved from one header row
#[derive(Debug, Clone, Default)]
pub struct SheetLayout {
    indices: HashMap<Column, usize>,
    pub receivables_label: Option<String>,
    pub payables_label: Option<String>,
    pub reporting_date: Option<NaiveDate>,
}

impl SheetLayout {
    const MANDATORY: [Column; 2] = [Column::TaxId, Column::ContractNumber];

    pub fn resolve<S: AsRef<str>>(headers: &[S]) -> Result<Self, ParseError> {
        let mut layout = SheetLayout::default();

        for column in Column::FIXED {
            if let Some(index) = headers.iter().position(|h| matches_label(h.as_ref(), column)) {
                layout.indices.insert(column, index);
            }
        }

        let receivables = RECEIVABLES_PREFIXES
            .iter()
            .find_map(|prefix| find_prefixed(headers, prefix));
        let payables = PAYABLES_PREFIXES
            .iter()
            .find_map(|prefix| find_prefixed(headers, prefix));

        if let Some(index) = receivables {
            let label = headers[index].as_ref();
            layout.indices.insert(Column::ReceivablesTotal, index);
            layout.reporting_date = report_date(label);
            layout.receivables_label = Some(label.to_string());

            // Sub-columns sit between the receivables and payables blocks
            let end = match payables {
                Some(p) if p > index => p,
                _ => headers.len(),
            };
            for column in [
                Column::ReceivablesActs,
                Column::ReceivablesCurrent,
                Column::ReceivablesOverdue,
            ] {
                let prefixes: Vec<String> =
                    column.labels().iter().map(|l| normalize_label(l)).collect();
                let found = (index + 1..end).find(|&i| {
                    let header = normalize_label(headers[i].as_ref());
                    prefixes.iter().any(|p| header.starts_with(p.as_str()))
                });
                if let Some(i) = found {
                    layout.indices.insert(column, i);
                }
            }
        }

        if let Some(index) = payables {
            layout.indices.insert(Column::PayablesTotal, index);
            layout.payables_label = Some(headers[index].as_ref().to_string());
        }

        let missing: Vec<String> = Self::MANDATORY
            .iter()
            .filter(|c| !layout.indices.contains_key(c))
            .map(|c| c.name().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ParseError::MissingColumns(missing));
        }

        Ok(layout)
    }

    pub fn index(&self, column: Column) -> Option<usize> {
        self.indices.get(&column).copied()
    }
}
