//! Ledger ingestion: the exchange transaction export as a normalized row set.
//!
//! Exports vary by locale (header names, delimiter, date format, decimal
//! comma), so everything downstream depends only on the normalized
//! [`LedgerRow`] fields. Rows that cannot be parsed are dropped and counted,
//! never silently discarded; only a totally unusable input is fatal.

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::str::FromStr;

/// Date formats seen in Binance ledger exports, tried in order.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%y-%m-%d %H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
];

/// A delimiter candidate must yield at least this many columns to be accepted.
const MIN_COLUMNS: usize = 4;

/// Only Spot-account rows are processed; margin and futures accounting is out
/// of scope and those rows are excluded with a warning.
const SPOT_ACCOUNT: &str = "Spot";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("could not detect a CSV delimiter yielding at least {MIN_COLUMNS} columns")]
    UndetectableFormat,
    #[error("missing required columns: {0}")]
    MissingColumns(String),
    #[error("ledger contains no data rows")]
    Empty,
    #[error("no Spot transactions found for tax year {0}")]
    NoRowsForYear(i32),
}

/// One normalized ledger entry. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    /// Transaction instant, assumed UTC.
    pub datetime: NaiveDateTime,
    /// Operation label from the exchange's controlled vocabulary.
    pub operation: String,
    /// Asset symbol, uppercased.
    pub asset: String,
    /// Signed quantity delta; sign determines inflow/outflow, never zero.
    pub change: Decimal,
    pub account: String,
    pub remark: Option<String>,
}

impl LedgerRow {
    pub fn date(&self) -> NaiveDate {
        self.datetime.date()
    }

    /// Unsigned quantity.
    pub fn quantity(&self) -> Decimal {
        self.change.abs()
    }

    pub fn is_inflow(&self) -> bool {
        self.change > Decimal::ZERO
    }

    pub fn is_outflow(&self) -> bool {
        self.change < Decimal::ZERO
    }
}

/// Counters describing what the reader did with the raw export.
#[derive(Debug, Default, Clone)]
pub struct ReadStats {
    /// Data rows in the file (before any filtering).
    pub rows_read: usize,
    /// Rows dropped for an unparseable timestamp/quantity or a zero quantity.
    pub malformed_dropped: usize,
    /// Rows excluded because they belong to a non-Spot account.
    pub non_spot_skipped: usize,
    /// The non-Spot account labels encountered, for the user warning.
    pub non_spot_accounts: BTreeSet<String>,
    /// Rows outside the target tax year.
    pub outside_year_skipped: usize,
}

/// Read the raw export and return the chronologically ordered Spot rows for
/// the target tax year, plus the read statistics.
pub fn read_ledger(
    input: &str,
    preferred_delimiter: u8,
    year: i32,
) -> Result<(Vec<LedgerRow>, ReadStats), LedgerError> {
    let input = input.strip_prefix('\u{feff}').unwrap_or(input);
    let delimiter = detect_delimiter(input, preferred_delimiter)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(input.as_bytes());

    let headers = reader
        .headers()
        .map_err(|_| LedgerError::UndetectableFormat)?
        .clone();
    let columns = ColumnMap::from_headers(&headers)?;

    let mut rows = Vec::new();
    let mut stats = ReadStats::default();

    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(err) => {
                log::debug!("dropping unreadable record: {err}");
                stats.rows_read += 1;
                stats.malformed_dropped += 1;
                continue;
            }
        };
        stats.rows_read += 1;

        let row = match columns.parse_row(&record) {
            Some(row) => row,
            None => {
                stats.malformed_dropped += 1;
                continue;
            }
        };

        if !row.account.eq_ignore_ascii_case(SPOT_ACCOUNT) {
            stats.non_spot_accounts.insert(row.account.clone());
            stats.non_spot_skipped += 1;
            continue;
        }
        if row.datetime.year() != year {
            stats.outside_year_skipped += 1;
            continue;
        }
        rows.push(row);
    }

    if stats.rows_read == 0 {
        return Err(LedgerError::Empty);
    }
    if rows.is_empty() {
        return Err(LedgerError::NoRowsForYear(year));
    }

    // The resolvers' preceding-day rule and caches rely on temporal locality,
    // so the fold must see rows in chronological order.
    rows.sort_by(|a, b| a.datetime.cmp(&b.datetime));

    if !stats.non_spot_accounts.is_empty() {
        log::warn!(
            "skipped {} rows from non-Spot accounts {:?}; margin/futures are not supported",
            stats.non_spot_skipped,
            stats.non_spot_accounts
        );
    }
    if stats.malformed_dropped > 0 {
        log::warn!("dropped {} malformed rows", stats.malformed_dropped);
    }

    Ok((rows, stats))
}

/// Try the preferred delimiter, then the common alternatives.
fn detect_delimiter(input: &str, preferred: u8) -> Result<u8, LedgerError> {
    let mut candidates = vec![preferred];
    for d in [b',', b';', b'\t'] {
        if d != preferred {
            candidates.push(d);
        }
    }
    for delimiter in candidates {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .from_reader(input.as_bytes());
        match reader.headers() {
            Ok(headers) if headers.len() >= MIN_COLUMNS => return Ok(delimiter),
            _ => continue,
        }
    }
    Err(LedgerError::UndetectableFormat)
}

/// Resolved positions of the logical fields within the export's columns.
struct ColumnMap {
    time: usize,
    operation: usize,
    asset: usize,
    change: usize,
    account: usize,
    remark: Option<usize>,
}

impl ColumnMap {
    /// Header aliases for the English and Polish export variants.
    const ALIASES: &'static [(&'static str, &'static [&'static str])] = &[
        ("UTC_Time", &["UTC_Time", "Czas", "Time", "Date"]),
        ("Operation", &["Operation", "Operacja", "Type"]),
        ("Coin", &["Coin", "Moneta", "Asset", "Currency"]),
        ("Change", &["Change", "Zmień", "Amount", "Quantity"]),
        ("Account", &["Account", "Konto"]),
        ("Remark", &["Remark", "Uwagi", "Note"]),
    ];

    fn from_headers(headers: &csv::StringRecord) -> Result<ColumnMap, LedgerError> {
        let find = |canonical: &str| -> Option<usize> {
            let aliases = Self::ALIASES
                .iter()
                .find(|(name, _)| *name == canonical)
                .map(|(_, aliases)| *aliases)?;
            aliases.iter().find_map(|alias| {
                headers
                    .iter()
                    .position(|h| h.trim().eq_ignore_ascii_case(alias))
            })
        };

        let mut missing = Vec::new();
        let mut require = |canonical: &'static str| -> usize {
            match find(canonical) {
                Some(idx) => idx,
                None => {
                    missing.push(canonical);
                    usize::MAX
                }
            }
        };

        let map = ColumnMap {
            time: require("UTC_Time"),
            operation: require("Operation"),
            asset: require("Coin"),
            change: require("Change"),
            account: require("Account"),
            remark: find("Remark"),
        };
        if !missing.is_empty() {
            return Err(LedgerError::MissingColumns(missing.join(", ")));
        }
        Ok(map)
    }

    /// Parse one record; `None` means the row is malformed and must be dropped.
    fn parse_row(&self, record: &csv::StringRecord) -> Option<LedgerRow> {
        let field = |idx: usize| record.get(idx).map(str::trim);

        let datetime = parse_datetime(field(self.time)?)?;
        let change = parse_change(field(self.change)?)?;
        if change.is_zero() {
            return None;
        }
        Some(LedgerRow {
            datetime,
            operation: field(self.operation)?.to_string(),
            asset: field(self.asset)?.to_uppercase(),
            change,
            account: field(self.account)?.to_string(),
            remark: self
                .remark
                .and_then(|idx| record.get(idx))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
    }
}

/// Try each known export date format in order.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Quantity parser tolerating a decimal comma.
pub fn parse_change(s: &str) -> Option<Decimal> {
    Decimal::from_str(&s.replace(',', ".")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const HEADER: &str = "User_ID,UTC_Time,Account,Operation,Coin,Change,Remark";

    fn ledger(rows: &[&str]) -> String {
        let mut out = String::from(HEADER);
        for row in rows {
            out.push('\n');
            out.push_str(row);
        }
        out
    }

    #[test]
    fn reads_and_sorts_spot_rows() {
        let input = ledger(&[
            "1,2025-03-02 12:00:00,Spot,Buy,BTC,0.5,",
            "1,2025-03-01 08:00:00,Spot,Sell,BTC,-0.2,",
        ]);
        let (rows, stats) = read_ledger(&input, b',', 2025).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(stats.rows_read, 2);
        // chronological order
        assert_eq!(rows[0].operation, "Sell");
        assert_eq!(rows[1].operation, "Buy");
        assert_eq!(rows[1].change, dec!(0.5));
        assert!(rows[1].is_inflow());
        assert!(rows[0].is_outflow());
    }

    #[test]
    fn detects_semicolon_delimiter() {
        let input = "UTC_Time;Account;Operation;Coin;Change\n\
                     2025-01-05 10:00:00;Spot;Buy;ETH;1.0";
        let (rows, _) = read_ledger(input, b',', 2025).unwrap();
        assert_eq!(rows[0].asset, "ETH");
    }

    #[test]
    fn polish_headers_are_normalized() {
        let input = "Czas,Konto,Operacja,Moneta,Zmień,Uwagi\n\
                     2025-01-05 10:00:00,Spot,Sell,BTC,-1.0,sprzedaż";
        let (rows, _) = read_ledger(input, b',', 2025).unwrap();
        assert_eq!(rows[0].operation, "Sell");
        assert_eq!(rows[0].remark.as_deref(), Some("sprzedaż"));
    }

    #[test]
    fn decimal_comma_is_tolerated() {
        assert_eq!(parse_change("1,5"), Some(dec!(1.5)));
        assert_eq!(parse_change("-0,25"), Some(dec!(-0.25)));
        assert_eq!(parse_change("abc"), None);
    }

    #[test]
    fn alternate_date_formats() {
        assert!(parse_datetime("2025-03-01 08:00:00").is_some());
        assert!(parse_datetime("01-03-2025 08:00:00").is_some());
        assert!(parse_datetime("03/01/2025 08:00:00").is_some());
        assert!(parse_datetime("not a date").is_none());
    }

    #[test]
    fn malformed_rows_are_dropped_and_counted() {
        let input = ledger(&[
            "1,2025-03-01 08:00:00,Spot,Buy,BTC,0.5,",
            "1,not-a-date,Spot,Buy,BTC,0.5,",
            "1,2025-03-01 09:00:00,Spot,Buy,BTC,zero?,",
            // zero quantity rows are invalid
            "1,2025-03-01 10:00:00,Spot,Buy,BTC,0,",
        ]);
        let (rows, stats) = read_ledger(&input, b',', 2025).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(stats.malformed_dropped, 3);
    }

    #[test]
    fn non_spot_accounts_are_excluded_and_reported() {
        let input = ledger(&[
            "1,2025-03-01 08:00:00,Spot,Buy,BTC,0.5,",
            "1,2025-03-01 09:00:00,Futures,Buy,BTC,0.5,",
            "1,2025-03-01 10:00:00,Margin,Buy,BTC,0.5,",
        ]);
        let (rows, stats) = read_ledger(&input, b',', 2025).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(stats.non_spot_skipped, 2);
        assert!(stats.non_spot_accounts.contains("Futures"));
        assert!(stats.non_spot_accounts.contains("Margin"));
    }

    #[test]
    fn rows_outside_target_year_are_excluded() {
        let input = ledger(&[
            "1,2024-12-31 23:59:59,Spot,Buy,BTC,0.5,",
            "1,2025-01-01 00:00:00,Spot,Buy,BTC,0.5,",
        ]);
        let (rows, stats) = read_ledger(&input, b',', 2025).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(stats.outside_year_skipped, 1);
    }

    #[test]
    fn missing_columns_is_fatal() {
        let input = "UTC_Time,Account,Coin,Change\n2025-01-01 00:00:00,Spot,BTC,1";
        match read_ledger(input, b',', 2025) {
            Err(LedgerError::MissingColumns(cols)) => assert!(cols.contains("Operation")),
            other => panic!("expected MissingColumns, got {other:?}"),
        }
    }

    #[test]
    fn empty_ledger_is_fatal() {
        let input = ledger(&[]);
        assert!(matches!(
            read_ledger(&input, b',', 2025),
            Err(LedgerError::Empty)
        ));
    }

    #[test]
    fn no_rows_for_year_is_fatal() {
        let input = ledger(&["1,2023-01-01 00:00:00,Spot,Buy,BTC,1,"]);
        assert!(matches!(
            read_ledger(&input, b',', 2025),
            Err(LedgerError::NoRowsForYear(2025))
        ));
    }

    #[test]
    fn bom_prefix_is_stripped() {
        let input = format!("\u{feff}{}", ledger(&["1,2025-01-01 00:00:00,Spot,Buy,BTC,1,"]));
        let (rows, _) = read_ledger(&input, b',', 2025).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
