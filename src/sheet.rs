use std::path::{Path, PathBuf};

use chrono::{Datelike, Days, NaiveDate};
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use tracing::{debug, info, warn};

use crate::config::ColumnConfig;
use crate::error::{InputError, RowError};
use crate::models::BillingRecord;

/// Rows read from an uploaded sheet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sheet {
    pub records: Vec<BillingRecord>,
    pub errors: Vec<RowError>,
}

/// A cell normalized across spreadsheet and CSV sources
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl Cell {
    fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    fn text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.trim().to_string(),
            Cell::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
            Cell::Number(n) => n.to_string(),
            Cell::Date(d) => d.to_string(),
        }
    }
}

/// Load billing records from a spreadsheet or CSV file.
///
/// Fails as a whole only when the file cannot be read or a required column
/// is missing; bad rows are collected into [`Sheet::errors`].
pub fn load(path: impl AsRef<Path>, columns: &ColumnConfig) -> Result<Sheet, InputError> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let rows = match extension.as_str() {
        "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => read_workbook(path)?,
        "csv" => read_csv(path)?,
        _ => return Err(InputError::UnsupportedFormat(path.display().to_string())),
    };

    let sheet = parse_rows(path, rows, columns)?;

    info!(
        path = %path.display(),
        records = sheet.records.len(),
        invalid = sheet.errors.len(),
        "Loaded billing sheet"
    );

    Ok(sheet)
}

/// Source rows paired with their 1-based row number in the file
type Rows = Vec<(usize, Result<Vec<Cell>, RowError>)>;

fn read_workbook(path: &Path) -> Result<Rows, InputError> {
    use calamine::Reader;

    let open_error = |reason: String| InputError::Open {
        path: path.to_path_buf(),
        reason,
    };

    let mut workbook = calamine::open_workbook_auto(path).map_err(|e| open_error(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| open_error("workbook has no sheets".to_string()))?
        .map_err(|e| open_error(e.to_string()))?;

    // The range begins at the first non-empty cell, not at A1
    let first_row = range.start().map(|(row, _)| row as usize + 1).unwrap_or(1);

    let rows: Rows = range
        .rows()
        .enumerate()
        .map(|(index, row)| (first_row + index, Ok(row.iter().map(cell_from_data).collect())))
        .collect();

    Ok(rows)
}

fn cell_from_data(data: &calamine::Data) -> Cell {
    use calamine::Data;

    match data {
        Data::String(s) | Data::DateTimeIso(s) => Cell::Text(s.clone()),
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::DateTime(dt) => match excel_serial_to_date(dt.as_f64()) {
            Some(date) => Cell::Date(date),
            None => Cell::Number(dt.as_f64()),
        },
        Data::Bool(b) => Cell::Text(b.to_string()),
        _ => Cell::Empty,
    }
}

fn read_csv(path: &Path) -> Result<Rows, InputError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| InputError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    // Blank lines are skipped by the reader, so take numbers from its positions
    let rows: Rows = rdr
        .records()
        .enumerate()
        .map(|(index, result)| match result {
            Ok(record) => {
                let row = record.position().map_or(index + 1, |p| p.line() as usize);
                (row, Ok(record.iter().map(|s| Cell::Text(s.to_string())).collect()))
            }
            Err(e) => {
                let row = e.position().map_or(index + 1, |p| p.line() as usize);
                let error = RowError {
                    row,
                    domain: None,
                    reason: format!("unreadable row: {}", e),
                };
                (row, Err(error))
            }
        })
        .collect();

    Ok(rows)
}

/// Resolve the configured columns in the header row and convert the rest.
fn parse_rows(path: &Path, rows: Rows, columns: &ColumnConfig) -> Result<Sheet, InputError> {
    let mut rows = rows.into_iter();

    let header = match rows.next() {
        Some((_, Ok(header))) => header,
        Some((_, Err(e))) => {
            return Err(InputError::Open {
                path: path.to_path_buf(),
                reason: e.reason,
            })
        }
        None => {
            return Err(InputError::Empty {
                path: PathBuf::from(path),
            })
        }
    };
    let names: Vec<String> = header.iter().map(Cell::text).collect();

    let find = |wanted: &str| -> Result<usize, InputError> {
        names
            .iter()
            .position(|name| name.trim().eq_ignore_ascii_case(wanted.trim()))
            .ok_or_else(|| InputError::MissingColumn {
                column: wanted.to_string(),
                found: names.join(", "),
            })
    };

    let domain_col = find(&columns.domain)?;
    let end_col = find(&columns.period_end)?;
    let frequency_col = find(&columns.frequency)?;

    let mut sheet = Sheet::default();

    for (row_number, row) in rows {
        let cells = match row {
            Ok(cells) => cells,
            Err(e) => {
                sheet.errors.push(e);
                continue;
            }
        };

        if cells.iter().all(Cell::is_empty) {
            continue;
        }

        let cell = |i: usize| cells.get(i).cloned().unwrap_or(Cell::Empty);

        match parse_record(row_number, cell(domain_col), cell(end_col), cell(frequency_col)) {
            Ok(record) => sheet.records.push(record),
            Err(e) => {
                warn!(row = e.row, reason = %e.reason, "Invalid sheet row");
                sheet.errors.push(e);
            }
        }
    }

    debug!(
        records = sheet.records.len(),
        errors = sheet.errors.len(),
        "Parsed sheet rows"
    );

    Ok(sheet)
}

fn parse_record(row: usize, domain: Cell, period_end: Cell, frequency: Cell) -> Result<BillingRecord, RowError> {
    let domain = domain.text();
    let row_error = |reason: String| RowError {
        row,
        domain: (!domain.is_empty()).then(|| domain.clone()),
        reason,
    };

    if domain.is_empty() {
        return Err(row_error("missing domain name".to_string()));
    }

    let period_end = match period_end {
        Cell::Date(date) => date,
        Cell::Number(serial) => excel_serial_to_date(serial)
            .ok_or_else(|| row_error(format!("invalid end date serial {}", serial)))?,
        Cell::Text(ref raw) if !raw.trim().is_empty() => parse_date(raw)
            .ok_or_else(|| row_error(format!("unparseable end date '{}'", raw.trim())))?,
        _ => return Err(row_error("missing end date".to_string())),
    };

    Ok(BillingRecord {
        row,
        domain,
        period_end,
        frequency: frequency.text(),
    })
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%d-%b-%Y",
    "%d %b %Y",
    "%B %d, %Y",
    "%b %d, %Y",
];

/// Parse a text date; a trailing time of day is discarded.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }

    // ISO date-times: "2024-04-15 00:00:00", "2024-04-15T09:30:00Z"
    if raw.len() > 10 && raw.is_char_boundary(10) {
        let (date, rest) = raw.split_at(10);
        if rest.starts_with([' ', 'T']) {
            if let Ok(date) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
                return Some(date);
            }
        }
    }

    // Serial numbers exported as text
    raw.parse::<f64>().ok().and_then(excel_serial_to_date)
}

/// Excel epoch is 1899-12-30 (accounting for the 1900 leap year bug)
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 || serial > 2_958_465.0 {
        return None;
    }
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_days(Days::new(serial.floor() as u64))
}

/// `NaiveDate::num_days_from_ce` of 1899-12-30
const EXCEL_EPOCH_DAYS_FROM_CE: i32 = 693_594;

pub fn date_to_excel_serial(date: NaiveDate) -> f64 {
    f64::from(date.num_days_from_ce() - EXCEL_EPOCH_DAYS_FROM_CE)
}

/// Serialize records as the batched summary workbook.
///
/// End dates are written as native date cells so the sheet sorts and
/// filters them as dates.
pub fn write_xlsx(records: &[BillingRecord]) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let date_format = Format::new().set_num_format("yyyy-mm-dd");

    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Billing Alerts")?;
    for (col, title) in (0u16..).zip(["Domain", "End Date", "Frequency"]) {
        worksheet.write_string_with_format(0, col, title, &bold)?;
    }
    worksheet.set_column_width(0, 32)?;
    worksheet.set_column_width(1, 12)?;
    worksheet.set_column_width(2, 14)?;

    for (row, record) in (1u32..).zip(records) {
        worksheet.write_string(row, 0, record.domain.as_str())?;
        worksheet.write_number_with_format(row, 1, date_to_excel_serial(record.period_end), &date_format)?;
        worksheet.write_string(row, 2, record.frequency.as_str())?;
    }

    workbook.save_to_buffer()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn write_sheet(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.csv");
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_csv() {
        let (_dir, path) = write_sheet(
            "domain name,Zoho_end period,billing frequency,notes\n\
             example.com,2024-04-15,Monthly,renews soon\n\
             other.org,05/12/2024,Annually,\n",
        );

        let sheet = load(&path, &ColumnConfig::default()).unwrap();
        assert!(sheet.errors.is_empty());
        assert_eq!(sheet.records.len(), 2);
        assert_eq!(
            sheet.records[0],
            BillingRecord {
                row: 2,
                domain: "example.com".to_string(),
                period_end: date(2024, 4, 15),
                frequency: "Monthly".to_string(),
            }
        );
        assert_eq!(sheet.records[1].period_end, date(2024, 5, 12));
        assert_eq!(sheet.records[1].row, 3);
    }

    #[test]
    fn test_header_match_is_case_insensitive_and_order_free() {
        let (_dir, path) = write_sheet(
            "Billing Frequency, DOMAIN NAME ,zoho_end period\n\
             Quarterly,example.com,2024-07-03\n",
        );

        let sheet = load(&path, &ColumnConfig::default()).unwrap();
        assert_eq!(sheet.records.len(), 1);
        assert_eq!(sheet.records[0].frequency, "Quarterly");
        assert_eq!(sheet.records[0].domain, "example.com");
    }

    #[test]
    fn test_missing_column() {
        let (_dir, path) = write_sheet("domain name,billing frequency\nexample.com,Monthly\n");

        let err = load(&path, &ColumnConfig::default()).unwrap_err();
        match err {
            InputError::MissingColumn { column, .. } => assert_eq!(column, "Zoho_end period"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bad_rows_reported_individually() {
        let (_dir, path) = write_sheet(
            "domain name,Zoho_end period,billing frequency\n\
             good.com,2024-04-15,Monthly\n\
             bad-date.com,sometime soon,Monthly\n\
             ,2024-04-15,Monthly\n\
             ,,\n\
             no-date.com,,Quarterly\n\
             also-good.com,2024-04-18,Quarterly\n",
        );

        let sheet = load(&path, &ColumnConfig::default()).unwrap();
        let domains: Vec<_> = sheet.records.iter().map(|r| r.domain.as_str()).collect();
        assert_eq!(domains, vec!["good.com", "also-good.com"]);

        assert_eq!(sheet.errors.len(), 3);
        assert_eq!(sheet.errors[0].row, 3);
        assert_eq!(sheet.errors[0].domain.as_deref(), Some("bad-date.com"));
        assert!(sheet.errors[0].reason.contains("sometime soon"));
        assert_eq!(sheet.errors[1].row, 4);
        assert_eq!(sheet.errors[1].reason, "missing domain name");
        assert_eq!(sheet.errors[2].row, 6);
        assert_eq!(sheet.errors[2].reason, "missing end date");
    }

    #[test]
    fn test_unsupported_and_unreadable() {
        let err = load("alerts.txt", &ColumnConfig::default()).unwrap_err();
        assert!(matches!(err, InputError::UnsupportedFormat(_)));

        let dir = tempfile::tempdir().unwrap();
        let err = load(dir.path().join("missing.csv"), &ColumnConfig::default()).unwrap_err();
        assert!(matches!(err, InputError::Open { .. }));
    }

    #[test]
    fn test_empty_file() {
        let (_dir, path) = write_sheet("");
        let err = load(&path, &ColumnConfig::default()).unwrap_err();
        assert!(matches!(err, InputError::Empty { .. }));
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = Some(date(2024, 4, 15));
        assert_eq!(parse_date("2024-04-15"), expected);
        assert_eq!(parse_date("2024/04/15"), expected);
        assert_eq!(parse_date("04/15/2024"), expected);
        assert_eq!(parse_date("15-Apr-2024"), expected);
        assert_eq!(parse_date("15 Apr 2024"), expected);
        assert_eq!(parse_date("April 15, 2024"), expected);
        assert_eq!(parse_date("2024-04-15 00:00:00"), expected);
        assert_eq!(parse_date("2024-04-15T09:30:00Z"), expected);
        assert_eq!(parse_date("45397"), expected);
        assert_eq!(parse_date("2024-02-30"), None);
        assert_eq!(parse_date("next week"), None);
    }

    #[test]
    fn test_excel_serial_to_date() {
        assert_eq!(excel_serial_to_date(45397.0), Some(date(2024, 4, 15)));
        assert_eq!(excel_serial_to_date(45397.75), Some(date(2024, 4, 15)));
        assert_eq!(excel_serial_to_date(45351.0), Some(date(2024, 2, 29)));
        assert_eq!(excel_serial_to_date(0.0), None);
        assert_eq!(excel_serial_to_date(f64::NAN), None);
    }

    /// Billing sheet with a blank first row and a notes tab after it
    fn write_workbook() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.xlsx");
        let date_format = Format::new().set_num_format("dd/mm/yyyy");

        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(1, 0, "domain name").unwrap();
        sheet.write_string(1, 1, "Zoho_end period").unwrap();
        sheet.write_string(1, 2, "billing frequency").unwrap();
        // Native date cell
        sheet.write_string(2, 0, "a.com").unwrap();
        sheet.write_number_with_format(2, 1, 45397.0, &date_format).unwrap();
        sheet.write_string(2, 2, "Monthly").unwrap();
        sheet.write_string(3, 0, "b.com").unwrap();
        sheet.write_string(3, 1, "31/31/2024").unwrap();
        sheet.write_string(3, 2, "Monthly").unwrap();
        // Bare serial number
        sheet.write_string(4, 0, "c.com").unwrap();
        sheet.write_number(4, 1, 45424.0).unwrap();
        sheet.write_string(4, 2, "Annually").unwrap();
        // Text date
        sheet.write_string(5, 0, "d.com").unwrap();
        sheet.write_string(5, 1, "2024-06-30").unwrap();
        sheet.write_string(5, 2, "Quarterly").unwrap();

        let notes = workbook.add_worksheet();
        notes.write_string(0, 0, "not billing data").unwrap();

        workbook.save(&path).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_xlsx() {
        let (_dir, path) = write_workbook();

        let sheet = load(&path, &ColumnConfig::default()).unwrap();
        let found: Vec<_> = sheet
            .records
            .iter()
            .map(|r| (r.row, r.domain.as_str(), r.period_end))
            .collect();
        assert_eq!(
            found,
            vec![
                (3, "a.com", date(2024, 4, 15)),
                (5, "c.com", date(2024, 5, 12)),
                (6, "d.com", date(2024, 6, 30)),
            ]
        );
        assert_eq!(sheet.records[1].frequency, "Annually");

        assert_eq!(sheet.errors.len(), 1);
        assert_eq!(sheet.errors[0].row, 4);
        assert_eq!(sheet.errors[0].domain.as_deref(), Some("b.com"));
        assert!(sheet.errors[0].reason.contains("31/31/2024"));
    }

    #[test]
    fn test_csv_row_numbers_survive_blank_lines() {
        let (_dir, path) = write_sheet(
            "\n\
             domain name,Zoho_end period,billing frequency\n\
             a.com,2024-04-15,Monthly\n\
             \n\
             b.com,later,Monthly\n",
        );

        let sheet = load(&path, &ColumnConfig::default()).unwrap();
        assert_eq!(sheet.records[0].row, 3);
        assert_eq!(sheet.errors[0].row, 5);
    }

    #[test]
    fn test_workbook_cells() {
        use calamine::Data;

        assert_eq!(cell_from_data(&Data::Int(45397)), Cell::Number(45397.0));
        assert_eq!(cell_from_data(&Data::Float(45397.0)), Cell::Number(45397.0));
        assert_eq!(
            cell_from_data(&Data::DateTimeIso("2024-04-15T00:00:00".to_string())),
            Cell::Text("2024-04-15T00:00:00".to_string())
        );
        assert_eq!(cell_from_data(&Data::Bool(true)), Cell::Text("true".to_string()));
        assert_eq!(cell_from_data(&Data::Empty), Cell::Empty);

        let record = parse_record(
            2,
            Cell::Text("example.com".to_string()),
            cell_from_data(&Data::DateTimeIso("2024-04-15T00:00:00".to_string())),
            Cell::Text("Monthly".to_string()),
        )
        .unwrap();
        assert_eq!(record.period_end, date(2024, 4, 15));
    }

    #[test]
    fn test_date_to_excel_serial() {
        assert_eq!(date_to_excel_serial(date(2024, 4, 15)), 45397.0);
        assert_eq!(date_to_excel_serial(date(2024, 2, 29)), 45351.0);
        assert_eq!(excel_serial_to_date(date_to_excel_serial(date(2031, 12, 31))), Some(date(2031, 12, 31)));
    }

    #[test]
    fn test_write_xlsx() {
        let records = vec![
            BillingRecord {
                row: 7,
                domain: "example.com".to_string(),
                period_end: date(2024, 4, 15),
                frequency: "Monthly".to_string(),
            },
            BillingRecord {
                row: 9,
                domain: "other.org".to_string(),
                period_end: date(2024, 5, 12),
                frequency: "Annually".to_string(),
            },
        ];

        let bytes = write_xlsx(&records).unwrap();
        assert!(bytes.starts_with(b"PK"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.xlsx");
        fs::write(&path, bytes).unwrap();
        let columns = ColumnConfig {
            domain: "Domain".to_string(),
            period_end: "End Date".to_string(),
            frequency: "Frequency".to_string(),
        };
        let sheet = load(&path, &columns).unwrap();
        assert!(sheet.errors.is_empty());
        let found: Vec<_> = sheet
            .records
            .iter()
            .map(|r| (r.row, r.domain.as_str(), r.period_end, r.frequency.as_str()))
            .collect();
        assert_eq!(
            found,
            vec![
                (2, "example.com", date(2024, 4, 15), "Monthly"),
                (3, "other.org", date(2024, 5, 12), "Annually"),
            ]
        );
    }
}
