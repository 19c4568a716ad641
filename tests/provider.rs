use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use tempfile::TempDir;

use svo_provider::catalog::memory::InMemoryCatalog;
use svo_provider::config::SourceKind;
use svo_provider::data_location::SizeProbe;
use svo_provider::files::FileScan;
use svo_provider::models::{KeywordDefinition, KeywordType, RawValue};
use svo_provider::progress::NoProgress;
use svo_provider::provider::{
    DatasetProfile, FileItems, Provider, SubmitOptions, SubmitSummary, TapItems,
};
use svo_provider::rules::{compile_rules, RuleSpec};
use svo_provider::tap::{QueryRunner, TapError, TapRecordStream};
use svo_provider::votable::{TapRecord, VoTable};

struct NoProbe;

#[async_trait]
impl SizeProbe for NoProbe {
    async fn content_length(&self, url: &str) -> Result<u64, String> {
        Err(format!("no network for {}", url))
    }
}

/// Serves fixed pages and records the queries it was asked.
struct Pages {
    pages: Mutex<Vec<Vec<TapRecord>>>,
    queries: Mutex<Vec<String>>,
}

#[async_trait]
impl QueryRunner for Pages {
    async fn run_query(&self, adql: &str) -> Result<VoTable, TapError> {
        self.queries.lock().unwrap().push(adql.to_string());
        let mut pages = self.pages.lock().unwrap();
        let rows = if pages.is_empty() {
            Vec::new()
        } else {
            pages.remove(0)
        };
        Ok(VoTable {
            fields: Vec::new(),
            rows,
        })
    }
}

fn keyword(name: &str, verbose_name: &str, keyword_type: KeywordType) -> KeywordDefinition {
    KeywordDefinition {
        name: name.into(),
        verbose_name: verbose_name.into(),
        keyword_type,
        unit: None,
        description: None,
    }
}

fn card(image: &str) -> String {
    format!("{:<80}", image)
}

fn write_fits(path: &Path, cards: &[&str]) {
    let mut text: String = cards.iter().map(|c| card(c)).collect();
    text.push_str(&card("END"));
    let len = text.len().div_ceil(2880) * 2880;
    let mut bytes = text.into_bytes();
    bytes.resize(len, b' ');
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

fn swap_file(dir: &Path, name: &str, date: &str) -> PathBuf {
    let path = dir.join(name);
    let date_obs = format!("DATE-OBS= '{}'", date);
    let date_end = format!("DATE-END= '{}'", date);
    write_fits(
        &path,
        &[
            "SIMPLE  =                    T",
            "BITPIX  =                    8",
            "NAXIS   =                    0",
            date_obs.as_str(),
            date_end.as_str(),
            "WAVELNTH=                  174 / [Angstrom] wavelength",
            "EXPTIME =                 10.0",
        ],
    );
    path
}

const SWAP_RULES: &str = r#"
wavemin = { rule = "divide", field = "wavelnth", by = 10 }
wavemax = { rule = "divide", field = "wavelnth", by = 10 }
"#;

async fn swap_provider(catalog: &Arc<InMemoryCatalog>, base: &Path) -> Provider {
    swap_provider_with(catalog, base, SWAP_RULES, None).await
}

async fn swap_provider_with(
    catalog: &Arc<InMemoryCatalog>,
    base: &Path,
    rules: &str,
    thumbnail_template: Option<&str>,
) -> Provider {
    catalog.add_dataset(
        "SWAP level 1",
        vec![
            keyword("date_beg", "DATE-OBS", KeywordType::Time),
            keyword("date_end", "DATE-END", KeywordType::Time),
            keyword("wavelnth", "WAVELNTH", KeywordType::Integer),
            keyword("exptime", "EXPTIME", KeywordType::Real),
            keyword("detector", "DETECTOR", KeywordType::Text),
        ],
    );
    let specs: IndexMap<String, RuleSpec> = toml::from_str(rules).unwrap();
    let mut profile = DatasetProfile::new("SWAP level 1", SourceKind::FitsFile);
    profile.rules = compile_rules(&specs).unwrap();
    profile.location.thumbnail_template = thumbnail_template.map(String::from);
    profile.location.base_file_path = Some(base.to_path_buf());
    profile.location.base_file_url = Some("https://proba2.oma.be/swap/data/bsd/".into());
    Provider::connect(
        catalog.clone(),
        Arc::new(NoProbe),
        reqwest::Client::new(),
        profile,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn fits_batch_creates_then_updates() {
    let tmp = TempDir::new().unwrap();
    swap_file(tmp.path(), "2021/06/01/swap_a.fits", "2021-06-01T12:00:00");
    swap_file(tmp.path(), "2021/06/01/swap_b.fits", "2021-06-01T12:01:40.500");
    std::fs::write(tmp.path().join("2021/06/01/notes.txt"), "not matched").unwrap();

    let catalog = Arc::new(InMemoryCatalog::new());
    let provider = swap_provider(&catalog, tmp.path()).await;
    let scan = FileScan::new(&[format!("{}/**/*.fits", tmp.path().display())]).unwrap();

    let summary = provider
        .submit_all(&mut FileItems::new(&scan), &SubmitOptions::default(), &NoProgress)
        .await;
    assert_eq!(
        summary,
        SubmitSummary {
            processed: 2,
            created: 2,
            ..Default::default()
        }
    );

    let payload = catalog
        .metadata_payload("SWAP level 1", "20210601120140")
        .unwrap();
    assert_eq!(payload["wavemin"], serde_json::json!(17.4));
    assert_eq!(payload["date_beg"], serde_json::json!("2021-06-01T12:01:40.500"));
    assert!(payload.get("detector").is_none());
    assert_eq!(
        payload["data_location"]["file_url"],
        serde_json::json!("https://proba2.oma.be/swap/data/bsd/2021/06/01/swap_b.fits")
    );
    assert_eq!(
        payload["data_location"]["file_path"],
        serde_json::json!("2021/06/01/swap_b.fits")
    );

    // Same files again: without --update the oids clash, with it they are patched.
    let summary = provider
        .submit_all(&mut FileItems::new(&scan), &SubmitOptions::default(), &NoProgress)
        .await;
    assert_eq!(summary.failed, 2);

    let update = SubmitOptions {
        update_existing: true,
        ..Default::default()
    };
    let summary = provider
        .submit_all(&mut FileItems::new(&scan), &update, &NoProgress)
        .await;
    assert_eq!(summary.updated, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(catalog.metadata_count(), 2);
    assert_eq!(catalog.data_location_count(), 2);
}

#[tokio::test]
async fn dry_run_submits_nothing() {
    let tmp = TempDir::new().unwrap();
    let path = swap_file(tmp.path(), "swap.fits", "2021-06-01T12:00:00");

    let catalog = Arc::new(InMemoryCatalog::new());
    let provider = swap_provider(&catalog, tmp.path()).await;
    let options = SubmitOptions {
        dry_run: true,
        ..Default::default()
    };
    let summary = provider
        .submit_all(&mut FileItems::from_paths(vec![path]), &options, &NoProgress)
        .await;
    assert_eq!(summary.dry_run, 1);
    assert_eq!(catalog.metadata_count(), 0);
    assert_eq!(catalog.data_location_count(), 0);
}

#[tokio::test]
async fn failing_item_does_not_stop_the_batch() {
    let tmp = TempDir::new().unwrap();
    let good = swap_file(tmp.path(), "a.fits", "2021-06-01T12:00:00");
    let no_date = tmp.path().join("b.fits");
    write_fits(
        &no_date,
        &[
            "SIMPLE  =                    T",
            "BITPIX  =                    8",
            "NAXIS   =                    0",
            "WAVELNTH=                  174",
        ],
    );
    let bad_date = tmp.path().join("c.fits");
    write_fits(
        &bad_date,
        &[
            "SIMPLE  =                    T",
            "BITPIX  =                    8",
            "NAXIS   =                    0",
            "DATE-OBS= 'yesterday'",
            "DATE-END= '2021-06-01T12:00:00'",
            "WAVELNTH=                  174",
        ],
    );

    let catalog = Arc::new(InMemoryCatalog::new());
    let provider = swap_provider(&catalog, tmp.path()).await;
    let mut items = FileItems::from_paths(vec![no_date, bad_date, good]);
    let summary = provider
        .submit_all(&mut items, &SubmitOptions::default(), &NoProgress)
        .await;
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.created, 1);
    assert!(catalog
        .metadata_payload("SWAP level 1", "20210601120000")
        .is_some());
}

#[tokio::test]
async fn out_of_range_end_date_fails_only_its_item() {
    let tmp = TempDir::new().unwrap();
    let huge = tmp.path().join("a.fits");
    write_fits(
        &huge,
        &[
            "SIMPLE  =                    T",
            "BITPIX  =                    8",
            "NAXIS   =                    0",
            "DATE-OBS= '2021-06-01T12:00:00'",
            "WAVELNTH=                  174",
            "EXPTIME =               1.0E300",
        ],
    );
    let good = swap_file(tmp.path(), "b.fits", "2021-06-01T12:01:40");

    let catalog = Arc::new(InMemoryCatalog::new());
    let rules = format!(
        "{}date_end = {{ rule = \"add_seconds\", field = \"date_beg\", seconds = \"exptime\" }}\n",
        SWAP_RULES
    );
    let provider = swap_provider_with(&catalog, tmp.path(), &rules, None).await;
    let summary = provider
        .submit_all(
            &mut FileItems::from_paths(vec![huge, good]),
            &SubmitOptions::default(),
            &NoProgress,
        )
        .await;
    assert_eq!(
        summary,
        SubmitSummary {
            processed: 2,
            created: 1,
            failed: 1,
            ..Default::default()
        }
    );
    let payload = catalog
        .metadata_payload("SWAP level 1", "20210601120140")
        .unwrap();
    assert_eq!(payload["date_end"], serde_json::json!("2021-06-01T12:01:50"));
}

#[tokio::test]
async fn bad_thumbnail_time_format_fails_items_without_aborting() {
    let tmp = TempDir::new().unwrap();
    let a = swap_file(tmp.path(), "a.fits", "2021-06-01T12:00:00");
    let b = swap_file(tmp.path(), "b.fits", "2021-06-01T12:01:40");

    let catalog = Arc::new(InMemoryCatalog::new());
    let provider = swap_provider_with(
        &catalog,
        tmp.path(),
        SWAP_RULES,
        Some("https://proba2.oma.be/{date_beg:%Q}.png"),
    )
    .await;
    let summary = provider
        .submit_all(
            &mut FileItems::from_paths(vec![a, b]),
            &SubmitOptions::default(),
            &NoProgress,
        )
        .await;
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(catalog.metadata_count(), 0);
}

fn lars_record(granule_uid: &str, start: &str, access_url: &str) -> TapRecord {
    TapRecord::from_pairs([
        ("granule_uid", RawValue::Text(granule_uid.into())),
        ("time_start", RawValue::Text(start.into())),
        ("time_end", RawValue::Text(start.into())),
        ("spectral_range_min", RawValue::Real(6302.0)),
        ("spectral_range_max", RawValue::Real(6303.0)),
        ("access_url", RawValue::Text(access_url.into())),
        ("access_estsize", RawValue::Null),
        ("thumbnail_url", RawValue::Null),
    ])
}

#[tokio::test]
async fn tap_records_share_data_locations() {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.add_dataset(
        "LARS level 1",
        vec![
            keyword("date_beg", "time_start", KeywordType::Time),
            keyword("date_end", "time_end", KeywordType::Time),
            keyword("spectral_range_min", "spectral_range_min", KeywordType::Real),
            keyword("wavemax", "spectral_range_max", KeywordType::Real),
        ],
    );
    let specs: IndexMap<String, RuleSpec> = toml::from_str(
        r#"
        oid = { rule = "format", template = "{granule_uid}" }
        granule_uid = { rule = "keyword", keyword = "granule_uid", type = "text" }
        wavemin = { rule = "divide", field = "spectral_range_min", by = 10 }
        "#,
    )
    .unwrap();
    let mut profile = DatasetProfile::new("LARS level 1", SourceKind::Tap);
    profile.rules = compile_rules(&specs).unwrap();
    profile.location.missing_file_size = Some(0);
    profile.location.missing_file_path = Some("{granule_uid}.tar".into());
    let provider = Provider::connect(
        catalog.clone(),
        Arc::new(NoProbe),
        reqwest::Client::new(),
        profile,
    )
    .await
    .unwrap();

    let shared = "https://dachs.sdc.leibniz-kis.de/lars/2018-05-14.tar";
    let runner = Pages {
        pages: Mutex::new(vec![
            vec![
                lars_record("lars_001", "2018-05-14T08:00:00", shared),
                lars_record("lars_002", "2018-05-14T08:10:00", shared),
            ],
            vec![lars_record(
                "lars_003",
                "2018-05-15T08:00:00",
                "https://dachs.sdc.leibniz-kis.de/lars/2018-05-15.tar",
            )],
        ]),
        queries: Mutex::new(Vec::new()),
    };
    let stream = TapRecordStream::new(&runner, "lars.epn_core", 2, None, Duration::ZERO);
    let summary = provider
        .submit_all(
            &mut TapItems::new(stream),
            &SubmitOptions::default(),
            &NoProgress,
        )
        .await;

    assert_eq!(
        summary,
        SubmitSummary {
            processed: 3,
            created: 2,
            reused: 1,
            ..Default::default()
        }
    );
    assert_eq!(catalog.data_location_count(), 2);
    assert_eq!(catalog.metadata_count(), 3);
    assert_eq!(runner.queries.lock().unwrap().len(), 2);

    let payload = catalog.metadata_payload("LARS level 1", "lars_001").unwrap();
    assert_eq!(payload["wavemin"], serde_json::json!(630.2));
    assert_eq!(payload["data_location"]["file_size"], serde_json::json!(0));
    assert_eq!(
        payload["data_location"]["file_path"],
        serde_json::json!("lars_001.tar")
    );

    // The second record references the location created for the first one.
    let reused = catalog.metadata_payload("LARS level 1", "lars_002").unwrap();
    assert!(reused["data_location"].is_string());
    assert_eq!(reused["oid"], serde_json::json!("lars_002"));
}
