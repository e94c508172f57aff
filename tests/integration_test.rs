use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use zip::write::FileOptions;

use stockfeed::fetch::{Fetch, FetchError};
use stockfeed::store::engine::{self, ApplyOutcome};
use stockfeed::store::Store;
use stockfeed::update;
use stockfeed::worker::{UpdateWorker, WorkerSettings};

/// Stands in for the HTTP feed: serves whatever file currently sits at
/// `source`, so tests can republish the feed between cycles.
struct FileFetcher {
    source: PathBuf,
}

impl Fetch for FileFetcher {
    fn download(&self, _url: &str, dest: &Path) -> Result<(), FetchError> {
        fs::copy(&self.source, dest).map_err(|e| FetchError::Io {
            path: dest.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }
}

/// Write a feed package the way the publisher does: a zip holding the
/// shared-string dictionary and the first worksheet.
fn publish_feed(path: &Path, stamp_text: &str, titles: &[&str], rows: &[&[&str]]) {
    let mut shared: Vec<String> = vec![stamp_text.to_string()];
    shared.extend(titles.iter().map(|t| t.to_string()));

    let mut sheet = String::from("<worksheet><sheetData>");
    sheet.push_str(r#"<row r="1"><c r="A1" t="s"><v>0</v></c></row>"#);

    sheet.push_str(r#"<row r="2">"#);
    for (i, _) in titles.iter().enumerate() {
        let column = column_letter(i);
        sheet.push_str(&format!(r#"<c r="{column}2" t="s"><v>{}</v></c>"#, i + 1));
    }
    sheet.push_str("</row>");

    for (row_offset, values) in rows.iter().enumerate() {
        let r = row_offset + 3;
        sheet.push_str(&format!(r#"<row r="{r}">"#));
        for (i, value) in values.iter().enumerate() {
            let column = column_letter(i);
            if value.parse::<f64>().is_ok() {
                sheet.push_str(&format!(r#"<c r="{column}{r}"><v>{value}</v></c>"#));
            } else {
                shared.push(value.to_string());
                sheet.push_str(&format!(
                    r#"<c r="{column}{r}" t="s"><v>{}</v></c>"#,
                    shared.len() - 1
                ));
            }
        }
        sheet.push_str("</row>");
    }
    sheet.push_str("</sheetData></worksheet>");

    let items: String = shared
        .iter()
        .map(|s| format!("<si><t>{s}</t></si>"))
        .collect();
    let sst = format!(
        "<sst count=\"{0}\" uniqueCount=\"{0}\">{items}</sst>",
        shared.len()
    );

    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::<()>::default().compression_method(zip::CompressionMethod::Deflated);

    zip.add_directory("xl/", options).unwrap();
    zip.start_file("xl/sharedStrings.xml", options).unwrap();
    zip.write_all(sst.as_bytes()).unwrap();
    zip.add_directory("xl/worksheets/", options).unwrap();
    zip.start_file("xl/worksheets/sheet1.xml", options).unwrap();
    zip.write_all(sheet.as_bytes()).unwrap();
    zip.finish().unwrap();
}

fn column_letter(index: usize) -> char {
    (b'A' + index as u8) as char
}

#[test]
fn feed_lifecycle_from_first_ingest_to_archive() {
    let dir = tempfile::tempdir().unwrap();
    let feed = dir.path().join("published-feed.zip");
    let work_dir = dir.path().join("work");
    let fetcher = FileFetcher {
        source: feed.clone(),
    };
    let mut store = Store::open(&dir.path().join("stockfeed.db")).unwrap();

    // day one, morning publication
    publish_feed(
        &feed,
        "Quotes updated 1402/7/5 at 9:5:1",
        &["Symbol", "Last", "Volume"],
        &[
            ["IRX6400", "1250.50", "300"].as_slice(),
            ["IRB7700", "80.25", "12"].as_slice(),
        ],
    );

    let first = update::run_cycle(&fetcher, &mut store, "http://feed.example", &work_dir).unwrap();
    assert_eq!(first.outcome, ApplyOutcome::Applied { archived: None });
    assert_eq!(first.stamp.date, "1402/07/05");
    assert_eq!(first.stamp.time, "09:05:01");

    // round trip: N titles and M rows, each row with N values
    let titles = engine::live_titles(&store).unwrap();
    assert_eq!(titles.len(), 3);
    let rows = engine::live_rows(&store).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.values.len() == titles.len()));
    assert_eq!(rows[0].values, ["IRX6400", "1250.5", "300"]);

    // unchanged republication is a no-op
    let marker_before = engine::last_update(&store).unwrap().unwrap();
    let second = update::run_cycle(&fetcher, &mut store, "http://feed.example", &work_dir).unwrap();
    assert_eq!(second.outcome, ApplyOutcome::Unchanged);
    assert!(engine::archive_entries(&store).unwrap().is_empty());
    let marker_after = engine::last_update(&store).unwrap().unwrap();
    assert_eq!(marker_after.updated_at, marker_before.updated_at);

    // intraday refresh: same date, new time, no archival
    publish_feed(
        &feed,
        "Quotes updated 1402/7/5 at 12:30:0",
        &["Symbol", "Last", "Volume"],
        &[
            ["IRX6400", "1310", "450"].as_slice(),
            ["IRB7700", "79.5", "20"].as_slice(),
        ],
    );
    let third = update::run_cycle(&fetcher, &mut store, "http://feed.example", &work_dir).unwrap();
    assert_eq!(third.outcome, ApplyOutcome::Applied { archived: None });
    assert!(engine::archive_entries(&store).unwrap().is_empty());
    assert_eq!(
        engine::live_rows(&store).unwrap()[0].values,
        ["IRX6400", "1310", "450"]
    );

    // next day: the previous snapshot is frozen before replacement
    publish_feed(
        &feed,
        "Quotes updated 1402/7/6 at 9:0:0",
        &["Symbol", "Last"],
        &[["IRX6400", "1400"].as_slice()],
    );
    let fourth = update::run_cycle(&fetcher, &mut store, "http://feed.example", &work_dir).unwrap();
    assert_eq!(
        fourth.outcome,
        ApplyOutcome::Applied {
            archived: Some("1402/07/05".to_string())
        }
    );

    let archives = engine::archive_entries(&store).unwrap();
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].date, "1402/07/05");
    assert_eq!(archives[0].time, "12:30:00");

    // the frozen copy is the last intraday state, unchanged
    let archived_rows = engine::archived_rows(&store, &archives[0]).unwrap();
    assert_eq!(archived_rows.len(), 2);
    assert_eq!(archived_rows[0].values, ["IRX6400", "1310", "450"]);
    assert_eq!(
        engine::archived_titles(&store, &archives[0]).unwrap().len(),
        3
    );

    // live tables carry the new, narrower snapshot
    assert_eq!(engine::live_titles(&store).unwrap().len(), 2);
    assert_eq!(engine::live_rows(&store).unwrap().len(), 1);

    // no scratch artifacts survive a cycle
    assert!(!work_dir.join("stock-quotes-latest.xlsx").exists());
    assert!(!work_dir.join("stock-quotes-extract").exists());
}

#[test]
fn worker_drives_the_pipeline_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let feed = dir.path().join("published-feed.zip");
    publish_feed(
        &feed,
        "Quotes updated 1402/8/1 at 10:0:0",
        &["Symbol", "Last"],
        &[["IRX6400", "1500"].as_slice()],
    );

    let db_path = dir.path().join("stockfeed.db");
    let store = Store::open(&db_path).unwrap();
    let worker = UpdateWorker::new(
        WorkerSettings {
            source_url: "http://feed.example/quotes.zip".to_string(),
            interval: Duration::from_millis(25),
            start_immediately: true,
            work_dir: dir.path().join("work"),
        },
        Box::new(FileFetcher { source: feed }),
        store,
    );

    worker.start();
    assert!(worker.is_running());
    std::thread::sleep(Duration::from_millis(200));
    worker.stop();
    assert!(!worker.is_running());

    // the worker's cycles populated the database; read it back over a
    // fresh connection like any downstream consumer would
    let reader = Store::open(&db_path).unwrap();
    let marker = engine::last_update(&reader).unwrap().unwrap();
    assert_eq!(marker.date, "1402/08/01");
    assert_eq!(marker.time, "10:00:00");
    assert_eq!(engine::live_row_count(&reader).unwrap(), 1);
    assert!(engine::archive_entries(&reader).unwrap().is_empty());
}
