//! Shareholder-register row types
//!
//! Rows travel through three shapes:
//! - `RawRow`: cells as read from the uploaded file, keyed by header and column letter
//! - `NormalizedRow`: canonical fields, possibly incomplete
//! - `ShareholderRecord`: validated wire form submitted to the session endpoint

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default share class when the file has none
pub const DEFAULT_SHARE_CLASS: &str = "Ordinære";

/// Default country code for person holders
pub const DEFAULT_COUNTRY_CODE: &str = "NO";

// =============================================================================
// RAW ROWS
// =============================================================================

/// Single spreadsheet cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
}

impl CellValue {
    /// Render the cell as text. Integral numbers are printed without a fraction
    /// so that `912345678.0` read from Excel becomes `912345678`.
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            CellValue::Number(n) => n.to_string(),
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

/// Fold a header name into its comparison key: lower-case, alphanumerics only,
/// Norwegian letters transliterated (`Fødselsår/orgnr` → `fodselsarorgnr`).
pub fn header_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        match c {
            'æ' => key.push_str("ae"),
            'ø' => key.push('o'),
            'å' => key.push('a'),
            c if c.is_alphanumeric() => key.push(c),
            _ => {}
        }
    }
    key
}

/// Spreadsheet column letter for a zero-based index (0 → `A`, 26 → `AA`)
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Untyped row as read from a CSV or spreadsheet file.
///
/// Cells are keyed by folded header name, or by column letter (`A`, `B`, ...)
/// for files without a recognized header row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    cells: HashMap<String, CellValue>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a row from header names and the values in the same positions.
    /// Values past the last header, or under a blank header, are dropped.
    pub fn from_cells<I>(headers: &[String], values: I) -> Self
    where
        I: IntoIterator<Item = CellValue>,
    {
        let mut row = Self::new();
        for (header, value) in headers.iter().zip(values) {
            if !header.trim().is_empty() {
                row.insert(header, value);
            }
        }
        row
    }

    /// Build a row keyed by column letter only
    pub fn positional<I>(values: I) -> Self
    where
        I: IntoIterator<Item = CellValue>,
    {
        let mut row = Self::new();
        for (idx, value) in values.into_iter().enumerate() {
            row.insert(&column_letter(idx), value);
        }
        row
    }

    pub fn insert(&mut self, column: &str, value: CellValue) {
        self.cells.insert(header_key(column), value);
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.cells.get(&header_key(column))
    }

    /// First non-empty trimmed value among the aliases, in alias order
    pub fn first_text(&self, aliases: &[&str]) -> Option<String> {
        aliases
            .iter()
            .filter_map(|alias| self.get(alias))
            .map(|v| v.as_text().trim().to_string())
            .find(|v| !v.is_empty())
    }

    /// True when every cell is empty (trailing spreadsheet rows)
    pub fn is_blank(&self) -> bool {
        self.cells.values().all(|v| v.as_text().trim().is_empty())
    }

    /// Rough in-memory footprint, used for the parser's memory estimate
    pub fn approx_size(&self) -> usize {
        self.cells
            .iter()
            .map(|(k, v)| {
                k.len()
                    + match v {
                        CellValue::Text(s) => s.len(),
                        CellValue::Number(_) => 8,
                    }
            })
            .sum()
    }
}

// =============================================================================
// NORMALIZED ROWS
// =============================================================================

/// Holder classification. A holder is either a company (identified by its own
/// organization number) or a person (birth year + country), never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "holder_type", rename_all = "lowercase")]
pub enum Holder {
    Company {
        holder_orgnr: String,
    },
    Person {
        birth_year: Option<i32>,
        country_code: String,
    },
}

impl Holder {
    pub fn is_company(&self) -> bool {
        matches!(self, Holder::Company { .. })
    }
}

/// Canonical row produced by the normalizer.
///
/// `orgnr` is always 9 digits when present; `None` means the source value was
/// missing or had the wrong length and the row will be rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    /// 1-based data row number in the source file (header excluded)
    pub row_number: u64,
    pub orgnr: Option<String>,
    /// Source text of the organization number, kept for diagnostics
    pub orgnr_raw: String,
    pub company_name: Option<String>,
    pub share_class: String,
    pub holder_name: Option<String>,
    pub holder: Holder,
    pub postal_place: Option<String>,
    pub shares: i64,
    pub total_shares: Option<i64>,
}

/// Reason a row is excluded before submission
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowIssue {
    #[error("row {row}: invalid organization number '{value}'")]
    InvalidOrgnr { row: u64, value: String },
    #[error("row {row}: missing both company name and holder name")]
    MissingNames { row: u64 },
}

impl NormalizedRow {
    /// Why this row would be dropped from a batch, if at all
    pub fn rejection(&self) -> Option<RowIssue> {
        if self.orgnr.is_none() {
            return Some(RowIssue::InvalidOrgnr {
                row: self.row_number,
                value: self.orgnr_raw.clone(),
            });
        }
        if self.company_name.is_none() && self.holder_name.is_none() {
            return Some(RowIssue::MissingNames { row: self.row_number });
        }
        None
    }

    /// Validate and convert into the submitted wire form, filling name
    /// placeholders from the organization numbers.
    pub fn into_record(self) -> Result<ShareholderRecord, RowIssue> {
        if let Some(issue) = self.rejection() {
            return Err(issue);
        }
        let Some(orgnr) = self.orgnr else {
            return Err(RowIssue::InvalidOrgnr {
                row: self.row_number,
                value: self.orgnr_raw,
            });
        };

        let company_name = self
            .company_name
            .unwrap_or_else(|| format!("Selskap {}", orgnr));
        let holder_name = self.holder_name.unwrap_or_else(|| {
            let id = match &self.holder {
                Holder::Company { holder_orgnr } => holder_orgnr.as_str(),
                Holder::Person { .. } => orgnr.as_str(),
            };
            format!("Ukjent aksjonær ({})", id)
        });

        Ok(ShareholderRecord {
            row_number: self.row_number,
            orgnr,
            company_name,
            share_class: self.share_class,
            holder_name,
            holder: self.holder,
            postal_place: self.postal_place,
            shares: self.shares,
            total_shares: self.total_shares,
        })
    }
}

/// Validated shareholder row, as carried in `PROCESS_BATCH.batch_data`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareholderRecord {
    pub row_number: u64,
    pub orgnr: String,
    pub company_name: String,
    pub share_class: String,
    pub holder_name: String,
    pub holder: Holder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_place: Option<String>,
    pub shares: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_shares: Option<i64>,
}

impl ShareholderRecord {
    /// Upsert key of the holding entity: `org:<orgnr>` for companies,
    /// `person:<lower-case name>|<birth year>|<country>` for persons
    pub fn entity_key(&self) -> String {
        match &self.holder {
            Holder::Company { holder_orgnr } => format!("org:{}", holder_orgnr),
            Holder::Person { birth_year, country_code } => format!(
                "person:{}|{}|{}",
                self.holder_name.trim().to_lowercase(),
                birth_year.map(|y| y.to_string()).unwrap_or_default(),
                country_code
            ),
        }
    }
}

/// Outcome of one batch submission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub processed_rows: u64,
    pub total_rows: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(orgnr: Option<&str>, company: Option<&str>, holder: Option<&str>) -> NormalizedRow {
        NormalizedRow {
            row_number: 3,
            orgnr: orgnr.map(str::to_string),
            orgnr_raw: orgnr.unwrap_or("1234567").to_string(),
            company_name: company.map(str::to_string),
            share_class: DEFAULT_SHARE_CLASS.to_string(),
            holder_name: holder.map(str::to_string),
            holder: Holder::Person { birth_year: Some(1970), country_code: "NO".to_string() },
            postal_place: None,
            shares: 10,
            total_shares: None,
        }
    }

    #[test]
    fn test_header_key_folds_norwegian_letters() {
        assert_eq!(header_key("Fødselsår/orgnr"), "fodselsarorgnr");
        assert_eq!(header_key("Navn aksjonær"), "navnaksjonaer");
        assert_eq!(header_key("Antall aksjer"), "antallaksjer");
        assert_eq!(header_key("org_nr"), "orgnr");
    }

    #[test]
    fn test_column_letters() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(8), "I");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
    }

    #[test]
    fn test_named_row_has_no_letter_keys() {
        let headers = vec!["Orgnr".to_string(), "Selskap".to_string()];
        let raw = RawRow::from_cells(&headers, vec!["912345678".into(), "Fjord AS".into()]);
        assert_eq!(raw.first_text(&["orgnr"]), Some("912345678".to_string()));
        assert_eq!(raw.first_text(&["B"]), None);
    }

    #[test]
    fn test_positional_row_keyed_by_letter() {
        let raw = RawRow::positional(vec!["912345678".into(), "Fjord AS".into()]);
        assert_eq!(raw.first_text(&["A"]), Some("912345678".to_string()));
        assert_eq!(raw.first_text(&["B"]), Some("Fjord AS".to_string()));
        assert_eq!(raw.first_text(&["orgnr"]), None);
    }

    #[test]
    fn test_first_text_skips_blank_values() {
        let mut raw = RawRow::new();
        raw.insert("selskap", "   ".into());
        raw.insert("company", " Fjord AS ".into());
        assert_eq!(raw.first_text(&["selskap", "company"]), Some("Fjord AS".to_string()));
    }

    #[test]
    fn test_cell_number_renders_without_fraction() {
        assert_eq!(CellValue::Number(912345678.0).as_text(), "912345678");
        assert_eq!(CellValue::Number(1.5).as_text(), "1.5");
    }

    #[test]
    fn test_rejection_invalid_orgnr() {
        let r = row(None, Some("Fjord AS"), Some("Ola"));
        assert_eq!(
            r.rejection(),
            Some(RowIssue::InvalidOrgnr { row: 3, value: "1234567".to_string() })
        );
    }

    #[test]
    fn test_rejection_missing_both_names() {
        let r = row(Some("912345678"), None, None);
        assert_eq!(r.rejection(), Some(RowIssue::MissingNames { row: 3 }));
    }

    #[test]
    fn test_into_record_fills_company_placeholder() {
        let record = row(Some("912345678"), None, Some("Ola Nordmann")).into_record().unwrap();
        assert_eq!(record.company_name, "Selskap 912345678");
        assert_eq!(record.holder_name, "Ola Nordmann");
    }

    #[test]
    fn test_holder_serializes_with_type_tag() {
        let holder = Holder::Company { holder_orgnr: "987654321".to_string() };
        let json = serde_json::to_string(&holder).unwrap();
        assert!(json.contains("\"holder_type\":\"company\""));
        assert!(json.contains("holder_orgnr"));
    }
}
