//! Tests for audit log rotation behavior.

use chrono::DateTime;
use initd::audit::{AuditLog, Level};
use tempfile::TempDir;

/// Upper bound for a single record: level tag, timestamp, message.
const RECORD_BOUND: u64 = 256;

fn rotated_files(dir: &TempDir) -> Vec<String> {
    std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("init.log."))
        .collect()
}

#[test]
fn test_heavy_logging_rotates_repeatedly() {
    let dir = TempDir::new().unwrap();
    let log = AuditLog::with_max_size(dir.path().join("init.log"), 1024);

    // Well over 5000 bytes of records.
    for i in 0..120 {
        log.emit(Level::Info, &format!("service event number {:04}", i));
    }

    assert!(!log.is_degraded());
    assert!(
        rotated_files(&dir).len() >= 4,
        "expected at least 4 rotated files, got {:?}",
        rotated_files(&dir)
    );

    let active = std::fs::metadata(log.path()).unwrap().len();
    assert!(
        active < 1024 + RECORD_BOUND,
        "active file too large: {}",
        active
    );
}

#[test]
fn test_rotated_files_have_unique_names() {
    let dir = TempDir::new().unwrap();
    let log = AuditLog::with_max_size(dir.path().join("init.log"), 128);

    // Several rotations land within the same second.
    for i in 0..40 {
        log.emit(Level::Warn, &format!("burst record {:02}", i));
    }

    let names = rotated_files(&dir);
    let mut deduped = names.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(names.len(), deduped.len(), "rotation overwrote a file");
    assert!(names.len() >= 2);
}

#[test]
fn test_record_timestamps_are_monotone() {
    let dir = TempDir::new().unwrap();
    let log = AuditLog::with_max_size(dir.path().join("init.log"), 1024 * 1024);

    for i in 0..50 {
        log.emit(Level::Info, &format!("tick {}", i));
    }

    let content = std::fs::read_to_string(log.path()).unwrap();
    let timestamps: Vec<DateTime<chrono::Utc>> = content
        .lines()
        .map(|line| {
            let field = line.split_whitespace().nth(1).expect("timestamp field");
            DateTime::parse_from_rfc3339(field)
                .expect("rfc3339 timestamp")
                .with_timezone(&chrono::Utc)
        })
        .collect();

    assert_eq!(timestamps.len(), 50);
    for pair in timestamps.windows(2) {
        assert!(pair[0] <= pair[1], "timestamps went backwards: {:?}", pair);
    }
}

#[test]
fn test_no_record_is_split_across_rotation() {
    let dir = TempDir::new().unwrap();
    let log = AuditLog::with_max_size(dir.path().join("init.log"), 512);

    for i in 0..60 {
        log.emit(Level::Info, &format!("integrity check record {:03}", i));
    }

    // Every line in every file, rotated or active, is a complete record.
    let paths: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();

    let mut seen = 0;
    for path in paths {
        let content = std::fs::read_to_string(&path).unwrap();
        for line in content.lines() {
            assert!(line.starts_with("[INFO] "), "broken record: {:?}", line);
            assert!(
                line.contains("integrity check record"),
                "truncated record: {:?}",
                line
            );
            seen += 1;
        }
        if !content.is_empty() {
            assert!(content.ends_with('\n'));
        }
    }
    assert_eq!(seen, 60);
}
