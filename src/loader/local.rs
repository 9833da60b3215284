//! Filesystem-backed bucket lister and bundle processor
//!
//! A local directory stands in for a bucket: sub-directories are paths and
//! regular files are bundles. Handy for development and for the CLI.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

use super::{BundleProcessor, BundleWorkItem};
use crate::catalog::{BucketLister, BucketObject};
use crate::ledger::LOGICAL_ID_MAX_LEN;
use crate::models::ProducedRecord;

/// File types picked up by default
pub const DEFAULT_EXTENSIONS: &[&str] = &["json", "ndjson"];

/// Lists the files below a root directory as bucket objects
#[derive(Debug, Clone)]
pub struct LocalDirLister {
    bucket_name: String,
    root: PathBuf,
    extensions: Vec<String>,
}

impl LocalDirLister {
    pub fn new(bucket_name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            root: root.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Only list files with one of these (case-insensitive) extensions
    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(|e| e.to_ascii_lowercase()).collect();
        self
    }

    fn walk(&self) -> anyhow::Result<Vec<BucketObject>> {
        let mut objects = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let entries = std::fs::read_dir(&dir)
                .with_context(|| format!("Failed to read directory: {}", dir.display()))?;

            for entry in entries {
                let entry = entry?;
                let file_type = entry.file_type()?;
                let path = entry.path();

                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let Some(extension) = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_ascii_lowercase)
                else {
                    continue;
                };
                if !self.extensions.contains(&extension) {
                    continue;
                }

                objects.push(BucketObject {
                    bucket_name: self.bucket_name.clone(),
                    path: bucket_path(&self.root, &dir),
                    object_name: entry.file_name().to_string_lossy().into_owned(),
                    size: entry.metadata()?.len() as i64,
                    file_type: extension,
                });
            }
        }

        objects.sort_by(|a, b| (&a.path, &a.object_name).cmp(&(&b.path, &b.object_name)));
        Ok(objects)
    }
}

/// `/` for the root itself, `/a/b/` for `root/a/b`
fn bucket_path(root: &Path, dir: &Path) -> String {
    let relative = dir.strip_prefix(root).unwrap_or(dir);
    let mut path = String::from("/");
    for component in relative.components() {
        path.push_str(&component.as_os_str().to_string_lossy());
        path.push('/');
    }
    path
}

#[async_trait]
impl BucketLister for LocalDirLister {
    async fn list(&self) -> anyhow::Result<Vec<BucketObject>> {
        let lister = self.clone();
        tokio::task::spawn_blocking(move || lister.walk())
            .await
            .context("Directory listing task failed")?
    }
}

/// Reads JSON bundles and NDJSON files from a local root
///
/// A `json` file holds either a single resource or a `Bundle` whose
/// `entry[].resource` are reported. An `ndjson` file holds one resource per
/// line. Resources without an `id` produce no record.
#[derive(Debug, Clone)]
pub struct JsonBundleProcessor {
    root: PathBuf,
}

impl JsonBundleProcessor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn file_path(&self, work: &BundleWorkItem) -> PathBuf {
        self.root
            .join(work.location.path.trim_start_matches('/'))
            .join(&work.bundle.object_name)
    }
}

fn push_resource(resource: &Value, records: &mut Vec<ProducedRecord>) {
    let kind = resource.get("resourceType").and_then(Value::as_str);
    let id = resource.get("id").and_then(Value::as_str);

    match (kind, id) {
        (Some(kind), Some(id)) if id.len() <= LOGICAL_ID_MAX_LEN => {
            records.push(ProducedRecord::new(kind, id));
        }
        (Some(kind), Some(id)) => {
            tracing::warn!(kind, id_len = id.len(), "Logical id too long, skipping resource");
        }
        _ => tracing::debug!("Resource without resourceType or id"),
    }
}

/// Extract the records of a parsed document
pub fn records_from_json(document: &Value) -> Vec<ProducedRecord> {
    let mut records = Vec::new();

    let is_bundle = document.get("resourceType").and_then(Value::as_str) == Some("Bundle");
    match document.get("entry").and_then(Value::as_array) {
        Some(entries) if is_bundle => {
            for resource in entries.iter().filter_map(|entry| entry.get("resource")) {
                push_resource(resource, &mut records);
            }
        }
        _ => push_resource(document, &mut records),
    }

    records
}

/// Extract the records of newline-delimited JSON
pub fn records_from_ndjson(content: &str) -> anyhow::Result<Vec<ProducedRecord>> {
    let mut records = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let resource: Value = serde_json::from_str(line)
            .with_context(|| format!("Invalid JSON on line {}", line_no + 1))?;
        push_resource(&resource, &mut records);
    }
    Ok(records)
}

#[async_trait]
impl BundleProcessor for JsonBundleProcessor {
    async fn process(&self, work: &BundleWorkItem) -> anyhow::Result<Vec<ProducedRecord>> {
        let path = self.file_path(work);
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read bundle: {}", path.display()))?;

        match work.bundle.file_type.as_str() {
            "ndjson" => records_from_ndjson(&content),
            "json" => {
                let document: Value = serde_json::from_str(&content)
                    .with_context(|| format!("Invalid JSON bundle: {}", path.display()))?;
                Ok(records_from_json(&document))
            }
            other => anyhow::bail!("Unsupported bundle file type: {other}"),
        }
    }
}
