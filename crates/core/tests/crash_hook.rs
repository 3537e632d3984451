//! The crash reporter replaces the process-wide panic hook, so each scenario runs in a child
//! copy of this test binary selected through `VIDHOOK_CRASH_SCENARIO`.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use vidhook_core::logging::{install_crash_reporter, CRASH_DIR_NAME, LOG_DIR_NAME};

const SCENARIO_VAR: &str = "VIDHOOK_CRASH_SCENARIO";
const DATA_DIR_VAR: &str = "VIDHOOK_CRASH_DATA_DIR";

fn run_scenario(scenario: &str, data_dir: &Path) -> Output {
    Command::new(std::env::current_exe().expect("test binary path"))
        .args(["crash_scenario", "--exact", "--nocapture"])
        .env(SCENARIO_VAR, scenario)
        .env(DATA_DIR_VAR, data_dir)
        .output()
        .expect("spawn crash scenario")
}

#[test]
fn crash_scenario() {
    let (Ok(scenario), Ok(data_dir)) = (std::env::var(SCENARIO_VAR), std::env::var(DATA_DIR_VAR))
    else {
        return;
    };
    let data_dir = Path::new(&data_dir);

    let crash_dir = install_crash_reporter(data_dir).expect("install crash reporter");
    assert_eq!(
        install_crash_reporter(data_dir).expect("reinstall"),
        crash_dir
    );

    match scenario.as_str() {
        "ingest_panic" => {
            panic!("ingest worker died fetching https://cdn.example.com/v.mp4?token=abc123&w=1")
        }
        "unwritable" => {
            fs::remove_dir_all(&crash_dir).expect("remove crash dir");
            fs::write(&crash_dir, b"blocked").expect("replace crash dir with a file");
            panic!("panic with nowhere to report");
        }
        other => panic!("unknown crash scenario {other}"),
    }
}

#[test]
fn panic_writes_redacted_crash_report() {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let output = run_scenario("ingest_panic", data_dir.path());
    assert!(!output.status.success());

    let crash_dir = data_dir.path().join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    let reports: Vec<_> = fs::read_dir(&crash_dir)
        .expect("crash dir")
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();
    assert_eq!(reports.len(), 1, "{reports:?}");

    let report = fs::read_to_string(&reports[0]).expect("read report");
    assert!(report.contains("message=ingest worker died fetching"), "{report}");
    assert!(report.contains("token=***REDACTED***&w=1"), "{report}");
    assert!(!report.contains("abc123"));
    assert!(report.contains("location="));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("panicked while processing panic"));
}

#[test]
fn unwritable_crash_dir_warns_without_a_second_panic() {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let output = run_scenario("unwritable", data_dir.path());
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("panic with nowhere to report"), "{stderr}");
    assert!(stderr.contains("Warning: failed to write crash report under"), "{stderr}");
    assert!(!stderr.contains("panicked while processing panic"));
}
