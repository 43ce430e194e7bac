//! Builds the buffer file from a folder of FHIR bundles.
//!
//! Each `*.json` file in the top level of the input folder is read as a
//! transaction/collection bundle. Intra-bundle `urn:uuid:` references are
//! rewritten to `Type/id` form, then every `entry[*].resource` is written as one
//! compact JSON line.

use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info};

const UUID_PREFIX: &str = "urn:uuid:";

/// Errors that can occur while building the buffer file.
#[derive(Debug)]
pub enum BundleError {
    /// Filesystem failure
    Io { path: PathBuf, source: std::io::Error },

    /// Bundle file is not valid JSON
    Parse { path: PathBuf, source: serde_json::Error },

    /// A `urn:uuid:` reference has no matching entry in its bundle
    ReferenceResolution { path: PathBuf, reference: String },
}

impl std::fmt::Display for BundleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleError::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
            BundleError::Parse { path, source } => {
                write!(f, "{} is not a valid JSON document: {}", path.display(), source)
            }
            BundleError::ReferenceResolution { path, reference } => write!(
                f,
                "Failed to resolve reference {} in {}",
                reference,
                path.display()
            ),
        }
    }
}

impl std::error::Error for BundleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BundleError::Io { source, .. } => Some(source),
            BundleError::Parse { source, .. } => Some(source),
            BundleError::ReferenceResolution { .. } => None,
        }
    }
}

/// Counters from one buffer build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferFileStats {
    /// Bundle files read
    pub bundles: u64,

    /// Resource lines written
    pub resources: u64,

    /// References rewritten from `urn:uuid:` form
    pub references_resolved: u64,
}

/// Flatten every bundle in `input_folder` into `buffer_path`, one resource per line.
///
/// The buffer file is truncated first. Any malformed bundle or unresolvable
/// reference aborts the build.
pub fn create_buffer_file(
    input_folder: &Path,
    buffer_path: &Path,
) -> Result<BufferFileStats, BundleError> {
    let mut files: Vec<PathBuf> = fs::read_dir(input_folder)
        .map_err(io_error(input_folder))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    info!(
        input_folder = %input_folder.display(),
        bundles = files.len(),
        buffer_file = %buffer_path.display(),
        "Creating buffer file"
    );

    let out = fs::File::create(buffer_path).map_err(io_error(buffer_path))?;
    let mut out = BufWriter::new(out);
    let mut stats = BufferFileStats::default();

    for file in &files {
        let text = fs::read_to_string(file).map_err(io_error(file))?;
        let mut bundle: Value = serde_json::from_str(&text).map_err(|source| BundleError::Parse {
            path: file.clone(),
            source,
        })?;

        let resolved = resolve_references(&mut bundle).map_err(|reference| {
            BundleError::ReferenceResolution {
                path: file.clone(),
                reference,
            }
        })?;

        let mut written = 0u64;
        for resource in bundle_resources(&bundle) {
            serde_json::to_writer(&mut out, resource).map_err(|e| BundleError::Io {
                path: buffer_path.to_path_buf(),
                source: e.into(),
            })?;
            out.write_all(b"\n").map_err(io_error(buffer_path))?;
            written += 1;
        }

        debug!(
            bundle = %file.display(),
            resources = written,
            references_resolved = resolved,
            "Bundle flattened"
        );

        stats.bundles += 1;
        stats.resources += written;
        stats.references_resolved += resolved;
    }

    out.flush().map_err(io_error(buffer_path))?;

    info!(
        bundles = stats.bundles,
        resources = stats.resources,
        references_resolved = stats.references_resolved,
        "Buffer file created"
    );

    Ok(stats)
}

/// The `entry[*].resource` objects of a bundle.
pub fn bundle_resources(bundle: &Value) -> impl Iterator<Item = &Value> {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("resource"))
}

/// Rewrite `urn:uuid:` references inside `bundle` to `Type/id`.
///
/// Entries whose `fullUrl` is a `urn:uuid:` get that uuid as their `id` when
/// they have none. Returns the number of references rewritten, or the first
/// reference that points at no entry.
pub fn resolve_references(bundle: &mut Value) -> Result<u64, String> {
    let Some(entries) = bundle.get_mut("entry").and_then(Value::as_array_mut) else {
        return Ok(0);
    };

    let mut targets: HashMap<String, String> = HashMap::new();

    for entry in entries.iter_mut() {
        let Some(uuid) = entry
            .get("fullUrl")
            .and_then(Value::as_str)
            .and_then(|url| url.strip_prefix(UUID_PREFIX))
            .map(str::to_string)
        else {
            continue;
        };

        let Some(resource) = entry.get_mut("resource").and_then(Value::as_object_mut) else {
            continue;
        };
        let Some(resource_type) = resource.get("resourceType").and_then(Value::as_str) else {
            continue;
        };
        let resource_type = resource_type.to_string();

        let existing_id = resource
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let id = match existing_id {
            Some(id) => id,
            None => {
                resource.insert("id".to_string(), Value::String(uuid.clone()));
                uuid.clone()
            }
        };

        targets.insert(format!("{}{}", UUID_PREFIX, uuid), format!("{}/{}", resource_type, id));
    }

    let mut resolved = 0;
    for entry in entries.iter_mut() {
        if let Some(resource) = entry.get_mut("resource") {
            rewrite(resource, &targets, &mut resolved)?;
        }
    }
    Ok(resolved)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BundleError {
    let path = path.to_path_buf();
    move |source| BundleError::Io { path, source }
}

fn rewrite(
    value: &mut Value,
    targets: &HashMap<String, String>,
    resolved: &mut u64,
) -> Result<(), String> {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key == "reference" {
                    if let Value::String(reference) = child {
                        if reference.starts_with(UUID_PREFIX) {
                            let target = targets
                                .get(reference.as_str())
                                .ok_or_else(|| reference.clone())?;
                            *reference = target.clone();
                            *resolved += 1;
                            continue;
                        }
                    }
                }
                rewrite(child, targets, resolved)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                rewrite(item, targets, resolved)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_bundle() -> Value {
        json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {
                    "fullUrl": "urn:uuid:p-1",
                    "resource": { "resourceType": "Patient", "name": [{ "family": "Doe" }] }
                },
                {
                    "fullUrl": "urn:uuid:e-1",
                    "resource": {
                        "resourceType": "Encounter",
                        "id": "enc",
                        "subject": { "reference": "urn:uuid:p-1" }
                    }
                },
                {
                    "fullUrl": "urn:uuid:o-1",
                    "resource": {
                        "resourceType": "Observation",
                        "subject": { "reference": "urn:uuid:p-1" },
                        "encounter": { "reference": "urn:uuid:e-1" },
                        "hasMember": [{ "reference": "Observation/external" }]
                    }
                }
            ]
        })
    }

    #[test]
    fn test_resolve_references() {
        let mut bundle = sample_bundle();
        let resolved = resolve_references(&mut bundle).unwrap();
        assert_eq!(resolved, 3);

        let resources: Vec<&Value> = bundle_resources(&bundle).collect();
        assert_eq!(resources[0]["id"], "p-1");
        assert_eq!(resources[1]["id"], "enc");
        assert_eq!(resources[1]["subject"]["reference"], "Patient/p-1");
        assert_eq!(resources[2]["subject"]["reference"], "Patient/p-1");
        assert_eq!(resources[2]["encounter"]["reference"], "Encounter/enc");
        assert_eq!(resources[2]["hasMember"][0]["reference"], "Observation/external");
    }

    #[test]
    fn test_unresolvable_reference() {
        let mut bundle = json!({
            "entry": [{
                "resource": {
                    "resourceType": "Observation",
                    "subject": { "reference": "urn:uuid:missing" }
                }
            }]
        });
        let err = resolve_references(&mut bundle).unwrap_err();
        assert_eq!(err, "urn:uuid:missing");
    }

    #[test]
    fn test_bundle_without_entries() {
        let mut bundle = json!({ "resourceType": "Bundle" });
        assert_eq!(resolve_references(&mut bundle).unwrap(), 0);
        assert_eq!(bundle_resources(&bundle).count(), 0);
    }

    #[test]
    fn test_create_buffer_file() {
        let input = tempfile::tempdir().unwrap();
        fs::write(input.path().join("a.json"), sample_bundle().to_string()).unwrap();
        fs::write(input.path().join("notes.txt"), "ignored").unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let buffer = out_dir.path().join("resources.json");

        let stats = create_buffer_file(input.path(), &buffer).unwrap();
        assert_eq!(
            stats,
            BufferFileStats {
                bundles: 1,
                resources: 3,
                references_resolved: 3,
            }
        );

        let text = fs::read_to_string(&buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            assert!(!line.contains('\n'));
            let value: Value = serde_json::from_str(line).unwrap();
            assert!(value.get("resourceType").is_some());
        }
    }

    #[test]
    fn test_buffer_lines_keep_key_order_and_numbers() {
        let input = tempfile::tempdir().unwrap();
        let bundle = concat!(
            r#"{"resourceType":"Bundle","entry":["#,
            r#"{"fullUrl":"urn:uuid:o1","resource":{"resourceType":"Observation","id":"o1","#,
            r#""valueQuantity":{"value":1.50},"valueInteger":123456789012345678901234}},"#,
            r#"{"fullUrl":"urn:uuid:p1","resource":{"resourceType":"Patient","active":true,"#,
            r#""link":[{"other":{"reference":"urn:uuid:o1"}}]}}"#,
            r#"]}"#
        );
        fs::write(input.path().join("ordered.json"), bundle).unwrap();
        let buffer = input.path().join("out.ndjson");

        create_buffer_file(input.path(), &buffer).unwrap();

        let text = fs::read_to_string(&buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                r#"{"resourceType":"Observation","id":"o1","valueQuantity":{"value":1.50},"valueInteger":123456789012345678901234}"#,
                r#"{"resourceType":"Patient","active":true,"link":[{"other":{"reference":"Observation/o1"}}],"id":"p1"}"#,
            ]
        );
    }

    #[test]
    fn test_create_buffer_file_rejects_invalid_json() {
        let input = tempfile::tempdir().unwrap();
        fs::write(input.path().join("broken.json"), "{ nope").unwrap();
        let buffer = input.path().join("out.ndjson");

        let err = create_buffer_file(input.path(), &buffer).unwrap_err();
        assert!(matches!(err, BundleError::Parse { .. }));
    }

    #[test]
    fn test_create_buffer_file_reports_unresolved_reference() {
        let input = tempfile::tempdir().unwrap();
        let bundle = json!({
            "entry": [{ "resource": { "resourceType": "Observation", "subject": { "reference": "urn:uuid:x" } } }]
        });
        fs::write(input.path().join("b.json"), bundle.to_string()).unwrap();
        let buffer = input.path().join("out.ndjson");

        let err = create_buffer_file(input.path(), &buffer).unwrap_err();
        match err {
            BundleError::ReferenceResolution { reference, .. } => assert_eq!(reference, "urn:uuid:x"),
            other => panic!("unexpected error: {}", other),
        }
    }
}
