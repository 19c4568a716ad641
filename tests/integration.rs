use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn svo_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_svo"))
}

fn write_fits(path: &Path, cards: &[&str]) {
    let mut text: String = cards.iter().map(|c| format!("{:<80}", c)).collect();
    text.push_str(&format!("{:<80}", "END"));
    let len = text.len().div_ceil(2880) * 2880;
    let mut bytes = text.into_bytes();
    bytes.resize(len, b' ');
    fs::write(path, bytes).unwrap();
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();
    for (name, date, exptime) in [
        ("swap_a.fits", "2021-06-01T12:00:00", "10.0"),
        ("swap_b.fits", "2021-06-01T12:01:40", "10.0"),
        ("swap_c.fits", "2021-06-01T12:03:20", "12.5"),
    ] {
        let date_obs = format!("DATE-OBS= '{}' / [UTC] start of observation", date);
        let exptime = format!("EXPTIME = {:>20} / [s] exposure time", exptime);
        write_fits(
            &data_dir.join(name),
            &[
                "SIMPLE  =                    T",
                "BITPIX  =                    8",
                "NAXIS   =                    0",
                date_obs.as_str(),
                exptime.as_str(),
                "WAVELNTH=                  174 / [Angstrom] wavelength",
                "CHECKSUM= 'ZZZZ'",
            ],
        );
    }

    // Nothing listens on port 9: catalog calls fail fast.
    let config_content = format!(
        r#"[catalog]
url = "http://127.0.0.1:9/service/api/svo"
auth_file = "{root}/missing_auth"
timeout_secs = 5

[datasets.swap]
name = "SWAP level 1"
source = "fits_file"
base_file_path = "{root}/data"
base_file_url = "https://proba2.oma.be/swap/data/bsd/"

[datasets.swap.fields]
wavemin = {{ rule = "divide", field = "wavelnth", by = 10 }}

[datasets.lars]
name = "LARS level 1"
source = "tap"

[datasets.lars.tap]
service_url = "http://127.0.0.1:9/tap"
table = "lars.epn_core"
"#,
        root = root.display()
    );

    let config_path = root.join("svo.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_svo(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = svo_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run svo binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_datasets_lists_configured_datasets() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_svo(&config_path, &["datasets"]);
    assert!(success, "datasets failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("KEY"));
    assert!(stdout.contains("SWAP level 1"));
    assert!(stdout.contains("fits_file"));
    assert!(stdout.contains("lars.epn_core"));
}

#[test]
fn test_missing_config_file() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_svo(&tmp.path().join("nope.toml"), &["datasets"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("svo.toml");
    fs::write(
        &config_path,
        r#"[datasets.eit]
name = "EIT level 0"
source = "fits_url"

[datasets.eit.fits]
header_size = 1000
"#,
    )
    .unwrap();

    let (_, stderr, success) = run_svo(&config_path, &["datasets"]);
    assert!(!success);
    assert!(stderr.contains("multiple of 2880"));
}

#[test]
fn test_submit_unknown_dataset() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_svo(&config_path, &["submit", "aia", "x.fits"]);
    assert!(!success);
    assert!(stderr.contains("Unknown dataset"));
    assert!(stderr.contains("swap, lars"));
}

#[test]
fn test_submit_fails_when_catalog_unreachable() {
    let (tmp, config_path) = setup_test_env();
    let pattern = format!("{}/data/*.fits", tmp.path().display());

    let (stdout, stderr, success) = run_svo(
        &config_path,
        &["submit", "swap", &pattern, "--dry-run", "--progress", "off"],
    );
    assert!(!success);
    assert!(stdout.is_empty());
    assert!(stderr.contains("Could not create provider for dataset \"swap\""));
}

#[test]
fn test_inspect_fits_writes_definitions() {
    let (tmp, config_path) = setup_test_env();
    let output = tmp.path().join("keywords.json");
    let pattern_a = format!("{}/data/swap_a.fits", tmp.path().display());
    let pattern_c = format!("{}/data/swap_c.fits", tmp.path().display());

    let (stdout, stderr, success) = run_svo(
        &config_path,
        &[
            "inspect",
            "fits",
            &pattern_a,
            &pattern_c,
            "--non-interactive",
            "--exclude",
            "naxis",
            "--output",
            output.to_str().unwrap(),
        ],
    );
    assert!(success, "inspect failed: stdout={}, stderr={}", stdout, stderr);

    let text = fs::read_to_string(&output).unwrap();
    let definitions: serde_json::Value = serde_json::from_str(&text).unwrap();
    let names: Vec<&str> = definitions
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["date_obs", "exptime", "wavelnth"]);
    assert_eq!(definitions[0]["type"], "time (ISO 8601)");
    assert_eq!(definitions[0]["unit"], "UTC");
    assert_eq!(definitions[1]["type"], "real");
    assert_eq!(definitions[1]["unit"], "s");
    assert_eq!(definitions[2]["type"], "integer");
    assert_eq!(definitions[2]["description"], "wavelength");
}

#[test]
fn test_inspect_fits_resumes_from_backup() {
    let (tmp, config_path) = setup_test_env();
    let output = tmp.path().join("keywords.json");
    let backup = tmp.path().join("backup.json");
    let file = format!("{}/data/swap_b.fits", tmp.path().display());
    let args = [
        "inspect",
        "fits",
        file.as_str(),
        "--non-interactive",
        "--backup",
        backup.to_str().unwrap(),
        "--output",
        output.to_str().unwrap(),
    ];

    let (_, stderr, success) = run_svo(&config_path, &args);
    assert!(success, "first inspect failed: {}", stderr);
    assert!(backup.exists());

    let (_, stderr, success) = run_svo(&config_path, &args);
    assert!(success, "second inspect failed: {}", stderr);
    assert!(stderr.contains("was already processed"));
    let text = fs::read_to_string(&output).unwrap();
    assert!(text.contains("\"exptime\""));
}

#[test]
fn test_help_lists_commands() {
    let output = Command::new(svo_binary()).arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["datasets", "keywords", "submit", "inspect"] {
        assert!(stdout.contains(command), "missing {} in help", command);
    }
}
