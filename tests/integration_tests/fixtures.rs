//! Test fixtures for integration tests
//!
//! Sample bundle files and helpers to lay them out as a local bucket.

use std::path::Path;

/// A transaction bundle with two patients and an observation
pub const SAMPLE_BUNDLE_JSON: &str = r#"{
  "resourceType": "Bundle",
  "type": "transaction",
  "entry": [
    {"resource": {"resourceType": "Patient", "id": "pat-1", "active": true}},
    {"resource": {"resourceType": "Patient", "id": "pat-2"}},
    {"resource": {"resourceType": "Observation", "id": "obs-1", "status": "final"}}
  ]
}"#;

/// NDJSON export overlapping the bundle above on `pat-1`
pub const SAMPLE_NDJSON: &str = r#"{"resourceType":"Patient","id":"pat-1"}
{"resourceType":"Patient","id":"pat-3"}
{"resourceType":"Encounter","id":"enc-1"}
"#;

/// Distinct records across both samples
pub const SAMPLE_DISTINCT_RECORDS: u64 = 5;

/// Write `count` copies of the samples under `root`, spread across two paths
///
/// Returns the number of files written.
pub fn write_bucket(root: &Path, count: usize) -> usize {
    std::fs::create_dir_all(root.join("2024").join("01")).unwrap();
    std::fs::create_dir_all(root.join("2024").join("02")).unwrap();

    for i in 0..count {
        let (dir, name, body) = if i % 2 == 0 {
            ("01", format!("bundle-{i}.json"), SAMPLE_BUNDLE_JSON)
        } else {
            ("02", format!("export-{i}.ndjson"), SAMPLE_NDJSON)
        };
        std::fs::write(root.join("2024").join(dir).join(name), body).unwrap();
    }
    count
}
