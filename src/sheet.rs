//! Spreadsheet parsing.
//!
//! Resolves an extracted OOXML package into the feed's logical shape: an
//! ordered list of column titles, the data rows beneath them, and the
//! publication stamp the feed embeds in its metadata row.
//!
//! The package layout is fixed: the shared-string dictionary lives at
//! `xl/sharedStrings.xml` and the (only interesting) worksheet at
//! `xl/worksheets/sheet1.xml`. Worksheet row 1 is metadata and carries the
//! date/time stamp, row 2 names the columns, every later row is data.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use serde::Serialize;

pub const SHARED_STRINGS_MEMBER: &str = "xl/sharedStrings.xml";
pub const SHEET1_MEMBER: &str = "xl/worksheets/sheet1.xml";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("package member {} is missing: {source}", path.display())]
    MissingMember {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("shared string index {index} out of range (dictionary holds {count})")]
    SharedStringIndex { index: usize, count: usize },

    #[error("malformed cell reference {0:?}")]
    BadCellReference(String),

    #[error("cell {cell} holds non-numeric value {value:?}")]
    NonNumericCell { cell: String, value: String },

    #[error("metadata row carries no recognizable date/time stamp")]
    MissingStamp,
}

/// One column of the feed: the worksheet column reference it came from and
/// the human-readable label from row 2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Title {
    pub column: String,
    pub label: String,
}

/// One data row, keyed by its 1-based worksheet row number. `values` is
/// always exactly as long as the title list; absent cells are empty strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub index: i64,
    pub values: Vec<String>,
}

/// The parsed feed: what the live tables should look like after this
/// snapshot is applied.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub titles: Vec<Title>,
    pub rows: Vec<DataRow>,
}

/// Normalized publication stamp, `yyyy/mm/dd` and `hh:mm:ss`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stamp {
    pub date: String,
    pub time: String,
}

/// Parse the extracted package at `package_dir`.
///
/// A worksheet with fewer than two rows yields an empty snapshot, not an
/// error; a missing or unextractable stamp is an error, because change
/// detection is impossible without one.
pub fn parse(package_dir: &Path) -> Result<(Snapshot, Stamp), ParseError> {
    let shared = read_shared_strings(&package_dir.join(SHARED_STRINGS_MEMBER))?;
    read_worksheet(&package_dir.join(SHEET1_MEMBER), &shared)
}

/// Load the shared-string dictionary: one entry per `<si>`, in document
/// order. Rich-text entries collapse to their concatenated run text so
/// every entry keeps its index.
fn read_shared_strings(path: &Path) -> Result<Vec<String>, ParseError> {
    let mut reader = open_member(path)?;

    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = current.is_some(),
                _ => {}
            },
            Event::Text(e) => {
                if in_text {
                    if let Some(s) = current.as_mut() {
                        s.push_str(&e.unescape()?);
                    }
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"t" => in_text = false,
                b"si" => {
                    if let Some(s) = current.take() {
                        strings.push(s);
                    }
                }
                _ => {}
            },
            Event::Empty(e) if e.name().as_ref() == b"si" => strings.push(String::new()),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(strings)
}

/// Raw cell as it appears in the worksheet stream, before shared-string
/// resolution.
struct RawCell {
    reference: String,
    shared: bool,
    value: Option<String>,
}

fn read_worksheet(path: &Path, shared: &[String]) -> Result<(Snapshot, Stamp), ParseError> {
    let mut reader = open_member(path)?;

    let mut snapshot = Snapshot::default();
    let mut columns: HashMap<String, usize> = HashMap::new();
    let mut date: Option<String> = None;
    let mut time: Option<String> = None;

    let mut row_index: i64 = 0;
    let mut cells: Vec<RawCell> = Vec::new();
    let mut current_cell: Option<RawCell> = None;
    let mut in_value = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.name().as_ref() == b"row" => {
                // rows without an r attribute take the next implicit index
                row_index = row_attr(&e).unwrap_or(row_index + 1);
                cells.clear();
            }
            Event::Empty(e) if e.name().as_ref() == b"row" => {
                row_index = row_attr(&e).unwrap_or(row_index + 1);
                cells.clear();
                handle_row(
                    row_index,
                    &cells,
                    shared,
                    &mut snapshot,
                    &mut columns,
                    &mut date,
                    &mut time,
                )?;
            }
            Event::End(e) if e.name().as_ref() == b"row" => {
                handle_row(
                    row_index,
                    &cells,
                    shared,
                    &mut snapshot,
                    &mut columns,
                    &mut date,
                    &mut time,
                )?;
                cells.clear();
            }
            Event::Start(e) if e.name().as_ref() == b"c" => {
                current_cell = Some(raw_cell(&e));
            }
            Event::Empty(e) if e.name().as_ref() == b"c" => {
                cells.push(raw_cell(&e));
            }
            Event::Start(e) if e.name().as_ref() == b"v" => {
                in_value = current_cell.is_some();
            }
            Event::Text(e) => {
                if in_value {
                    if let Some(cell) = current_cell.as_mut() {
                        let text = e.unescape()?;
                        match cell.value.as_mut() {
                            Some(v) => v.push_str(&text),
                            None => cell.value = Some(text.into_owned()),
                        }
                    }
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"v" => in_value = false,
                b"c" => {
                    if let Some(cell) = current_cell.take() {
                        cells.push(cell);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    match (date, time) {
        (Some(date), Some(time)) => Ok((snapshot, Stamp { date, time })),
        _ => Err(ParseError::MissingStamp),
    }
}

fn open_member(path: &Path) -> Result<Reader<BufReader<File>>, ParseError> {
    let file = File::open(path).map_err(|e| ParseError::MissingMember {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut reader = Reader::from_reader(BufReader::new(file));
    reader.config_mut().trim_text(true);
    Ok(reader)
}

fn raw_cell(e: &BytesStart) -> RawCell {
    let mut reference = String::new();
    let mut shared = false;

    for attr in e.attributes().flatten() {
        match attr.key.as_ref() {
            b"r" => reference = String::from_utf8_lossy(&attr.value).into_owned(),
            b"t" => shared = attr.value.as_ref() == b"s",
            _ => {}
        }
    }

    RawCell {
        reference,
        shared,
        value: None,
    }
}

fn row_attr(e: &BytesStart) -> Option<i64> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == b"r" {
            return String::from_utf8_lossy(&attr.value).parse().ok();
        }
    }
    None
}

fn handle_row(
    row_index: i64,
    cells: &[RawCell],
    shared: &[String],
    snapshot: &mut Snapshot,
    columns: &mut HashMap<String, usize>,
    date: &mut Option<String>,
    time: &mut Option<String>,
) -> Result<(), ParseError> {
    match row_index {
        1 => scan_stamp(cells, shared, date, time),
        2 => {
            let titles = build_titles(cells, shared)?;
            *columns = titles
                .iter()
                .enumerate()
                .map(|(pos, t)| (t.column.clone(), pos))
                .collect();
            snapshot.titles = titles;
            Ok(())
        }
        n if n > 2 => {
            let row = build_row(n, cells, shared, &snapshot.titles, columns)?;
            snapshot.rows.push(row);
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Row 1: find the first shared-string cell carrying a date-like and a
/// time-like pattern and keep the normalized forms.
fn scan_stamp(
    cells: &[RawCell],
    shared: &[String],
    date: &mut Option<String>,
    time: &mut Option<String>,
) -> Result<(), ParseError> {
    for cell in cells {
        if !cell.shared {
            continue;
        }
        let Some(raw) = cell.value.as_deref() else {
            continue;
        };
        let text = resolve_shared(raw, shared, &cell.reference)?;

        if date.is_none() {
            if let Some(m) = date_pattern().find(&text) {
                *date = Some(normalize_stamp(m.as_str(), '/'));
            }
        }
        if time.is_none() {
            if let Some(m) = time_pattern().find(&text) {
                *time = Some(normalize_stamp(m.as_str(), ':'));
            }
        }
    }
    Ok(())
}

/// Row 2: every valued cell defines a column, in document order.
fn build_titles(cells: &[RawCell], shared: &[String]) -> Result<Vec<Title>, ParseError> {
    let mut titles = Vec::new();

    for cell in cells {
        let Some(raw) = cell.value.as_deref() else {
            continue;
        };
        let label = if cell.shared {
            resolve_shared(raw, shared, &cell.reference)?
        } else {
            raw.to_string()
        };

        titles.push(Title {
            column: column_of(&cell.reference)?,
            label,
        });
    }

    Ok(titles)
}

/// Rows 3+: project the row's cells onto the row-2 column order. Cells in
/// columns row 2 did not define are dropped; titles without a cell become
/// empty strings.
fn build_row(
    row_index: i64,
    cells: &[RawCell],
    shared: &[String],
    titles: &[Title],
    columns: &HashMap<String, usize>,
) -> Result<DataRow, ParseError> {
    let mut values = vec![String::new(); titles.len()];

    for cell in cells {
        let Some(raw) = cell.value.as_deref() else {
            continue;
        };

        let Some(&pos) = columns.get(&column_of(&cell.reference)?) else {
            continue;
        };

        values[pos] = if cell.shared {
            resolve_shared(raw, shared, &cell.reference)?
        } else {
            // numeric cells round-trip through f64 so "1250.50" and
            // "1250.5" persist identically
            let number: f64 = raw.trim().parse().map_err(|_| ParseError::NonNumericCell {
                cell: cell.reference.clone(),
                value: raw.to_string(),
            })?;
            number.to_string()
        };
    }

    Ok(DataRow {
        index: row_index,
        values,
    })
}

fn resolve_shared(raw: &str, shared: &[String], reference: &str) -> Result<String, ParseError> {
    let index: usize = raw
        .trim()
        .parse()
        .map_err(|_| ParseError::NonNumericCell {
            cell: reference.to_string(),
            value: raw.to_string(),
        })?;

    shared
        .get(index)
        .cloned()
        .ok_or(ParseError::SharedStringIndex {
            index,
            count: shared.len(),
        })
}

/// The letter part of a cell reference (`"BC7"` → `"BC"`).
fn column_of(reference: &str) -> Result<String, ParseError> {
    let letters: String = reference
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    let digits = &reference[letters.len()..];

    if letters.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::BadCellReference(reference.to_string()));
    }

    Ok(letters)
}

/// Zero-pad every component of a matched stamp to at least two digits and
/// rejoin: `"1402/7/5"` → `"1402/07/05"`, `"9:5:1"` → `"09:05:01"`.
fn normalize_stamp(raw: &str, separator: char) -> String {
    raw.split(separator)
        .map(|part| format!("{part:0>2}"))
        .collect::<Vec<_>>()
        .join(&separator.to_string())
}

// Jalali calendar years; the feed publishes 13xx/14xx dates.
fn date_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b1[34]\d{2}/(1[0-2]|0?[1-9])/([12]\d|3[01]|0?[1-9])\b")
            .expect("hardcoded pattern")
    })
}

fn time_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(2[0-3]|[01]?\d):([0-5]?\d):([0-5]?\d)\b").expect("hardcoded pattern")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_package(dir: &Path, shared: &[&str], rows: &str) {
        fs::create_dir_all(dir.join("xl/worksheets")).unwrap();

        let items: String = shared
            .iter()
            .map(|s| format!("<si><t>{s}</t></si>"))
            .collect();
        fs::write(
            dir.join(SHARED_STRINGS_MEMBER),
            format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
                 <sst count=\"{0}\" uniqueCount=\"{0}\">{items}</sst>",
                shared.len()
            ),
        )
        .unwrap();

        fs::write(
            dir.join(SHEET1_MEMBER),
            format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
                 <worksheet><sheetData>{rows}</sheetData></worksheet>"
            ),
        )
        .unwrap();
    }

    fn standard_package(dir: &Path) {
        write_package(
            dir,
            &[
                "Quotes updated 1402/7/5 at 9:5:1",
                "Symbol",
                "Last price",
                "Volume",
                "IRX6400",
                "IRB7700",
            ],
            r#"<row r="1"><c r="A1" t="s"><v>0</v></c></row>
               <row r="2"><c r="A2" t="s"><v>1</v></c><c r="B2" t="s"><v>2</v></c><c r="C2" t="s"><v>3</v></c></row>
               <row r="3"><c r="A3" t="s"><v>4</v></c><c r="B3"><v>1250.50</v></c><c r="C3"><v>300</v></c></row>
               <row r="4"><c r="A4" t="s"><v>5</v></c><c r="B4"><v>80.25</v></c><c r="C4"><v>12</v></c></row>"#,
        );
    }

    #[test]
    fn parses_titles_rows_and_stamp() {
        let dir = tempfile::tempdir().unwrap();
        standard_package(dir.path());

        let (snapshot, stamp) = parse(dir.path()).unwrap();

        assert_eq!(
            stamp,
            Stamp {
                date: "1402/07/05".into(),
                time: "09:05:01".into()
            }
        );

        let columns: Vec<&str> = snapshot.titles.iter().map(|t| t.column.as_str()).collect();
        let labels: Vec<&str> = snapshot.titles.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(columns, ["A", "B", "C"]);
        assert_eq!(labels, ["Symbol", "Last price", "Volume"]);

        assert_eq!(snapshot.rows.len(), 2);
        assert_eq!(snapshot.rows[0].index, 3);
        assert_eq!(snapshot.rows[0].values, ["IRX6400", "1250.5", "300"]);
        assert_eq!(snapshot.rows[1].index, 4);
        assert_eq!(snapshot.rows[1].values, ["IRB7700", "80.25", "12"]);
    }

    #[test]
    fn stamp_components_are_zero_padded() {
        assert_eq!(normalize_stamp("1402/7/5", '/'), "1402/07/05");
        assert_eq!(normalize_stamp("9:5:1", ':'), "09:05:01");
        assert_eq!(normalize_stamp("1402/12/30", '/'), "1402/12/30");
        assert_eq!(normalize_stamp("23:59:59", ':'), "23:59:59");
    }

    #[test]
    fn stamp_is_found_in_any_metadata_cell() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            &["no stamp here", "date 1402/11/3", "time 14:30:00", "T"],
            r#"<row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c><c r="C1" t="s"><v>2</v></c></row>
               <row r="2"><c r="A2" t="s"><v>3</v></c></row>"#,
        );

        let (_, stamp) = parse(dir.path()).unwrap();
        assert_eq!(stamp.date, "1402/11/03");
        assert_eq!(stamp.time, "14:30:00");
    }

    #[test]
    fn fewer_than_two_rows_is_an_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            &["updated 1402/1/1 at 10:00:00"],
            r#"<row r="1"><c r="A1" t="s"><v>0</v></c></row>"#,
        );

        let (snapshot, stamp) = parse(dir.path()).unwrap();
        assert!(snapshot.titles.is_empty());
        assert!(snapshot.rows.is_empty());
        assert_eq!(stamp.date, "1402/01/01");
    }

    #[test]
    fn missing_stamp_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            &["no dates anywhere", "Symbol"],
            r#"<row r="1"><c r="A1" t="s"><v>0</v></c></row>
               <row r="2"><c r="A2" t="s"><v>1</v></c></row>"#,
        );

        assert!(matches!(
            parse(dir.path()).unwrap_err(),
            ParseError::MissingStamp
        ));
    }

    #[test]
    fn out_of_range_shared_string_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            &["updated 1402/1/1 at 10:00:00", "Symbol"],
            r#"<row r="1"><c r="A1" t="s"><v>0</v></c></row>
               <row r="2"><c r="A2" t="s"><v>1</v></c></row>
               <row r="3"><c r="A3" t="s"><v>99</v></c></row>"#,
        );

        assert!(matches!(
            parse(dir.path()).unwrap_err(),
            ParseError::SharedStringIndex { index: 99, count: 2 }
        ));
    }

    #[test]
    fn missing_package_member_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // no files at all
        assert!(matches!(
            parse(dir.path()).unwrap_err(),
            ParseError::MissingMember { .. }
        ));
    }

    #[test]
    fn rich_text_entries_keep_their_dictionary_index() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("xl/worksheets")).unwrap();
        fs::write(
            dir.path().join(SHARED_STRINGS_MEMBER),
            "<sst><si><r><t>updated 1402/2/2 </t></r><r><t>at 11:22:33</t></r></si>\
             <si><t>Symbol</t></si></sst>",
        )
        .unwrap();
        fs::write(
            dir.path().join(SHEET1_MEMBER),
            r#"<worksheet><sheetData>
               <row r="1"><c r="A1" t="s"><v>0</v></c></row>
               <row r="2"><c r="A2" t="s"><v>1</v></c></row>
               </sheetData></worksheet>"#,
        )
        .unwrap();

        let (snapshot, stamp) = parse(dir.path()).unwrap();
        assert_eq!(stamp.date, "1402/02/02");
        assert_eq!(snapshot.titles[0].label, "Symbol");
    }

    #[test]
    fn ragged_rows_fill_missing_columns_with_empty_strings() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            &["updated 1402/1/1 at 10:00:00", "Symbol", "Price", "X"],
            r#"<row r="1"><c r="A1" t="s"><v>0</v></c></row>
               <row r="2"><c r="A2" t="s"><v>1</v></c><c r="B2" t="s"><v>2</v></c></row>
               <row r="3"><c r="B3"><v>42</v></c><c r="Z3" t="s"><v>3</v></c></row>"#,
        );

        let (snapshot, _) = parse(dir.path()).unwrap();
        // A3 missing -> empty; Z3 has no row-2 title -> dropped
        assert_eq!(snapshot.rows[0].values, ["", "42"]);
    }

    #[test]
    fn non_numeric_plain_cell_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            &["updated 1402/1/1 at 10:00:00", "Symbol"],
            r#"<row r="1"><c r="A1" t="s"><v>0</v></c></row>
               <row r="2"><c r="A2" t="s"><v>1</v></c></row>
               <row r="3"><c r="A3"><v>not a number</v></c></row>"#,
        );

        assert!(matches!(
            parse(dir.path()).unwrap_err(),
            ParseError::NonNumericCell { .. }
        ));
    }

    #[test]
    fn bad_cell_reference_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            &["updated 1402/1/1 at 10:00:00", "Symbol"],
            r#"<row r="1"><c r="A1" t="s"><v>0</v></c></row>
               <row r="2"><c r="2A" t="s"><v>1</v></c></row>"#,
        );

        assert!(matches!(
            parse(dir.path()).unwrap_err(),
            ParseError::BadCellReference(_)
        ));
    }
}
