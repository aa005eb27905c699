//! Row normalizer
//!
//! Maps shareholder-register rows with Norwegian/English header variants (or
//! bare positional columns A–I, the layout of the official register export)
//! into `NormalizedRow`. Pure and infallible: bad input degrades to defaults
//! or to a missing organization number, and the row is dropped downstream.

use std::collections::HashSet;

use chrono::Datelike;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{
    header_key, Holder, NormalizedRow, RawRow, DEFAULT_COUNTRY_CODE, DEFAULT_SHARE_CLASS,
};

// Aliases are compared through `header_key`, so case, spaces, punctuation and
// æ/ø/å spellings do not matter. The last alias is the positional fallback.
const ORGNR_ALIASES: &[&str] = &[
    "orgnr", "organisasjonsnummer", "organization_number", "orgnumber", "selskap_orgnr", "A",
];
const COMPANY_NAME_ALIASES: &[&str] = &[
    "selskap", "selskapsnavn", "navn_selskap", "company", "company_name", "B",
];
const SHARE_CLASS_ALIASES: &[&str] = &["aksjeklasse", "share_class", "klasse", "C"];
const HOLDER_NAME_ALIASES: &[&str] = &[
    "navn_aksjonær", "aksjonær", "aksjonær_navn", "holder_name", "shareholder", "navn", "D",
];
const HOLDER_ID_ALIASES: &[&str] = &[
    "fødselsår/orgnr", "fødselsår_orgnr", "holder_orgnr", "holder_id", "E",
];
const POSTAL_ALIASES: &[&str] = &["postnr/sted", "poststed", "postal_place", "F"];
const COUNTRY_ALIASES: &[&str] = &["landkode", "country_code", "land", "country", "G"];
const SHARES_ALIASES: &[&str] = &["antall_aksjer", "shares", "antall", "share_count", "H"];
const TOTAL_SHARES_ALIASES: &[&str] = &[
    "antall_aksjer_selskap", "total_shares", "aksjer_totalt", "I",
];
const BIRTH_YEAR_ALIASES: &[&str] = &["fødselsår", "birth_year", "født"];

const ALL_ALIASES: &[&[&str]] = &[
    ORGNR_ALIASES,
    COMPANY_NAME_ALIASES,
    SHARE_CLASS_ALIASES,
    HOLDER_NAME_ALIASES,
    HOLDER_ID_ALIASES,
    POSTAL_ALIASES,
    COUNTRY_ALIASES,
    SHARES_ALIASES,
    TOTAL_SHARES_ALIASES,
    BIRTH_YEAR_ALIASES,
];

static YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(19|20)\d{2}\b").expect("valid year pattern"));

/// True when at least one header names a known column. Files without such a
/// header row are read positionally (columns A–I).
pub fn recognizes_headers(headers: &[String]) -> bool {
    let named: HashSet<String> = ALL_ALIASES
        .iter()
        .flat_map(|aliases| aliases.iter())
        .filter(|alias| alias.len() > 1)
        .map(|alias| header_key(alias))
        .collect();
    headers.iter().any(|h| named.contains(&header_key(h)))
}

/// Normalize one raw row. `row_number` is the 1-based data row in the file.
pub fn normalize_row(raw: &RawRow, row_number: u64) -> NormalizedRow {
    normalize_row_at(raw, row_number, chrono::Utc::now().year())
}

/// Same as `normalize_row` with an explicit current year for birth-year bounds
pub fn normalize_row_at(raw: &RawRow, row_number: u64, current_year: i32) -> NormalizedRow {
    let orgnr_raw = raw.first_text(ORGNR_ALIASES).unwrap_or_default();
    let orgnr = normalize_orgnr(&orgnr_raw);

    let company_name = raw.first_text(COMPANY_NAME_ALIASES);
    let share_class = raw
        .first_text(SHARE_CLASS_ALIASES)
        .unwrap_or_else(|| DEFAULT_SHARE_CLASS.to_string());
    let holder_name = raw.first_text(HOLDER_NAME_ALIASES);
    let holder_id = raw.first_text(HOLDER_ID_ALIASES).unwrap_or_default();

    let holder = classify_holder(raw, &holder_id, holder_name.as_deref(), current_year);

    NormalizedRow {
        row_number,
        orgnr,
        orgnr_raw,
        company_name,
        share_class,
        holder_name,
        holder,
        postal_place: raw.first_text(POSTAL_ALIASES),
        shares: parse_count(raw.first_text(SHARES_ALIASES).as_deref()).unwrap_or(0),
        total_shares: parse_count(raw.first_text(TOTAL_SHARES_ALIASES).as_deref()),
    }
}

/// Strip non-digits; 8 digits are left-padded to 9, 9 pass, anything else is invalid
pub fn normalize_orgnr(value: &str) -> Option<String> {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        8 => Some(format!("0{}", digits)),
        9 => Some(digits),
        _ => None,
    }
}

/// Strip non-digits and parse; `None` when nothing numeric remains
pub fn parse_count(value: Option<&str>) -> Option<i64> {
    let digits: String = value?.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn classify_holder(
    raw: &RawRow,
    holder_id: &str,
    holder_name: Option<&str>,
    current_year: i32,
) -> Holder {
    let compact: String = holder_id.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() == 9 && compact.chars().all(|c| c.is_ascii_digit()) {
        return Holder::Company { holder_orgnr: compact };
    }

    let birth_year = std::iter::once(Some(holder_id.to_string()))
        .chain(BIRTH_YEAR_ALIASES.iter().map(|alias| raw.first_text(&[*alias])))
        .chain(std::iter::once(holder_name.map(str::to_string)))
        .flatten()
        .find_map(|text| find_birth_year(&text, current_year));

    let country_code = raw
        .first_text(COUNTRY_ALIASES)
        .map(|c| c.to_uppercase())
        .unwrap_or_else(|| DEFAULT_COUNTRY_CODE.to_string());

    Holder::Person { birth_year, country_code }
}

/// First 4-digit year between 1900 and `current_year` in the text
fn find_birth_year(text: &str, current_year: i32) -> Option<i32> {
    YEAR_RE
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<i32>().ok())
        .find(|year| (1900..=current_year).contains(year))
}
