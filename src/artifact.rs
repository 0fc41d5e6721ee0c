//! Reading and writing of the persisted artifacts that connect the pipeline stages.
//!
//! Matrix and label artifacts are wrapped in a small header (`format`, `version`,
//! `shape`) so a reader can reject a foreign or truncated file before touching the
//! payload. Every write goes to a sibling temp file first and is renamed into place.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, ser};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::cluster::LabelVector;
use crate::embed::EmbeddingMatrix;
use crate::error::{AppError, AppResult};
use crate::themes::AnnotatedFeedback;

pub static EMBEDDINGS_FORMAT: &str = "feedback-themes/embeddings";
pub static LABELS_FORMAT: &str = "feedback-themes/labels";
pub const ARTIFACT_VERSION: u32 = 1;

pub static DEFAULT_FEEDBACK_FILE: &str = "sample_feedback.json";
pub static DEFAULT_EMBEDDINGS_FILE: &str = "feedback_embeddings.json";
pub static DEFAULT_LABELS_FILE: &str = "cluster_labels.json";
pub static DEFAULT_ANNOTATED_FILE: &str = "clustered_feedback_analyzed.json";

/// On-disk form of an [`EmbeddingMatrix`].
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct EmbeddingArtifact {
    /// Always `feedback-themes/embeddings`.
    pub format: String,
    pub version: u32,
    #[serde(with = "crate::serde_helpers::offset_datetime")]
    #[schemars(with = "String")]
    pub created_at: OffsetDateTime,
    /// `[rows, dimensions]`.
    pub shape: [usize; 2],
    /// One vector per feedback item, in input order.
    pub data: Vec<Vec<f32>>,
}

/// On-disk form of a [`LabelVector`].
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct LabelArtifact {
    /// Always `feedback-themes/labels`.
    pub format: String,
    pub version: u32,
    #[serde(with = "crate::serde_helpers::offset_datetime")]
    #[schemars(with = "String")]
    pub created_at: OffsetDateTime,
    /// `[rows]`.
    pub shape: [usize; 1],
    /// Number of clusters requested; every label is below it.
    pub k: usize,
    /// Seed used for center initialisation.
    pub seed: u64,
    /// One cluster id per feedback item, in input order.
    pub data: Vec<usize>,
}

/// Locations of every artifact for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub feedback: PathBuf,
    pub embeddings: PathBuf,
    pub labels: PathBuf,
    pub annotated: PathBuf,
}

impl ArtifactPaths {
    /// Default file names under `workdir`.
    pub fn in_dir<P: AsRef<Path>>(workdir: P) -> Self {
        let dir = workdir.as_ref();
        Self {
            feedback: dir.join(DEFAULT_FEEDBACK_FILE),
            embeddings: dir.join(DEFAULT_EMBEDDINGS_FILE),
            labels: dir.join(DEFAULT_LABELS_FILE),
            annotated: dir.join(DEFAULT_ANNOTATED_FILE),
        }
    }
}

/// Read a whole artifact, turning "not found" into [`AppError::MissingArtifact`].
pub async fn read_artifact<P: AsRef<Path>>(path: P) -> AppResult<Vec<u8>> {
    let path = path.as_ref();
    match fs::read(path).await {
        Ok(bytes) => {
            trace!("Read {} bytes from {}", bytes.len(), path.display());
            Ok(bytes)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Err(AppError::MissingArtifact(path.into())),
        Err(e) => Err(AppError::malformed(path, format!("unreadable: {e}"))),
    }
}

/// Decode JSON, reporting the failing path inside the document on error.
pub fn decode_json<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> AppResult<T> {
    let de = &mut serde_json::Deserializer::from_slice(bytes);
    serde_path_to_error::deserialize(de).map_err(|e| {
        let at = e.path().to_string();
        if at == "." {
            AppError::malformed(path, e.into_inner())
        } else {
            AppError::malformed(path, format!("at {at}: {}", e.into_inner()))
        }
    })
}

/// Load the feedback source: a JSON array of non-blank strings.
#[tracing::instrument(name = "Loading feedback", level = "debug")]
pub async fn load_feedback(path: &Path) -> AppResult<Vec<String>> {
    let bytes = read_artifact(path).await?;
    let value: Value = decode_json(path, &bytes)?;
    let Value::Array(items) = value else {
        return Err(AppError::malformed(
            path,
            "expected a JSON array of feedback strings",
        ));
    };
    let mut texts = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        match item {
            Value::String(text) if text.trim().is_empty() => {
                return Err(AppError::InvalidInput(format!(
                    "feedback item {i} in {} is blank",
                    path.display()
                )));
            }
            Value::String(text) => texts.push(text),
            other => {
                return Err(AppError::InvalidInput(format!(
                    "feedback item {i} in {} is not a string: {other}",
                    path.display()
                )));
            }
        }
    }
    debug!("Loaded {} feedback strings from {}", texts.len(), path.display());
    Ok(texts)
}

/// Persist an embedding matrix with its header.
#[tracing::instrument(name = "Saving embeddings", level = "debug", skip(matrix))]
pub async fn save_embeddings(path: &Path, matrix: &EmbeddingMatrix) -> AppResult<()> {
    let artifact = EmbeddingArtifact {
        format: EMBEDDINGS_FORMAT.to_string(),
        version: ARTIFACT_VERSION,
        created_at: OffsetDateTime::now_utc(),
        shape: [matrix.len(), matrix.dim()],
        data: matrix.rows().to_vec(),
    };
    write_json_atomic(path, &artifact).await
}

/// Load and validate an embedding matrix.
#[tracing::instrument(name = "Loading embeddings", level = "debug")]
pub async fn load_embeddings(path: &Path) -> AppResult<EmbeddingMatrix> {
    let bytes = read_artifact(path).await?;
    let artifact: EmbeddingArtifact = decode_json(path, &bytes)?;
    check_header(path, &artifact.format, EMBEDDINGS_FORMAT, artifact.version)?;

    let [rows, dim] = artifact.shape;
    if artifact.data.len() != rows {
        return Err(AppError::malformed(
            path,
            format!(
                "header declares {rows} rows but {} are present",
                artifact.data.len()
            ),
        ));
    }
    if rows > 0 && dim == 0 {
        return Err(AppError::malformed(path, "non-empty matrix with zero dimensions"));
    }
    if let Some((i, row)) = artifact
        .data
        .iter()
        .enumerate()
        .find(|(_, row)| row.len() != dim)
    {
        return Err(AppError::malformed(
            path,
            format!("row {i} has {} values, header declares {dim}", row.len()),
        ));
    }
    EmbeddingMatrix::from_rows(artifact.data).map_err(|reason| AppError::malformed(path, reason))
}

/// Persist a label vector with its header.
#[tracing::instrument(name = "Saving labels", level = "debug", skip(labels))]
pub async fn save_labels(path: &Path, labels: &LabelVector) -> AppResult<()> {
    let artifact = LabelArtifact {
        format: LABELS_FORMAT.to_string(),
        version: ARTIFACT_VERSION,
        created_at: OffsetDateTime::now_utc(),
        shape: [labels.len()],
        k: labels.k(),
        seed: labels.seed(),
        data: labels.as_slice().to_vec(),
    };
    write_json_atomic(path, &artifact).await
}

/// Load and validate a label vector.
#[tracing::instrument(name = "Loading labels", level = "debug")]
pub async fn load_labels(path: &Path) -> AppResult<LabelVector> {
    let bytes = read_artifact(path).await?;
    let artifact: LabelArtifact = decode_json(path, &bytes)?;
    check_header(path, &artifact.format, LABELS_FORMAT, artifact.version)?;

    let [rows] = artifact.shape;
    if artifact.data.len() != rows {
        return Err(AppError::malformed(
            path,
            format!(
                "header declares {rows} labels but {} are present",
                artifact.data.len()
            ),
        ));
    }
    LabelVector::new(artifact.data, artifact.k, artifact.seed)
        .map_err(|reason| AppError::malformed(path, reason))
}

/// Persist the annotated output as a plain, pretty-printed JSON array.
#[tracing::instrument(name = "Saving annotated feedback", level = "debug", skip(records))]
pub async fn save_annotated(path: &Path, records: &[AnnotatedFeedback]) -> AppResult<()> {
    write_json_atomic(path, &records).await
}

/// Load the annotated output without validating individual records.
///
/// Record-level problems are the reporter's concern; only a non-list document is fatal here.
#[tracing::instrument(name = "Loading annotated feedback", level = "debug")]
pub async fn load_annotated(path: &Path) -> AppResult<Vec<Value>> {
    let bytes = read_artifact(path).await?;
    match decode_json::<Value>(path, &bytes)? {
        Value::Array(items) => Ok(items),
        other => Err(AppError::malformed(
            path,
            format!("expected a JSON array of records, found {}", json_kind(&other)),
        )),
    }
}

fn check_header(path: &Path, format: &str, expected: &str, version: u32) -> AppResult<()> {
    if format != expected {
        return Err(AppError::malformed(
            path,
            format!("format is '{format}', expected '{expected}'"),
        ));
    }
    if version != ARTIFACT_VERSION {
        return Err(AppError::malformed(
            path,
            format!("unsupported version {version}, expected {ARTIFACT_VERSION}"),
        ));
    }
    Ok(())
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Serialize an object to pretty JSON and write it to disk atomically.
#[tracing::instrument(name = "Writing JSON file", level = "trace", skip(obj))]
pub async fn write_json_atomic<P: AsRef<Path> + std::fmt::Debug, S: ser::Serialize>(
    output: P,
    obj: &S,
) -> AppResult<()> {
    let mut data = serde_json::to_vec_pretty(obj)?;
    data.push(b'\n');
    write_file_atomic(output, &data).await
}

/// Write to a sibling temp file, sync, then rename over `output`.
///
/// Readers observe either the previous file or the complete new one.
async fn write_file_atomic<P: AsRef<Path>>(output: P, data: &[u8]) -> AppResult<()> {
    let output = output.as_ref();
    let file_name = output
        .file_name()
        .ok_or_else(|| {
            std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("{} is not a file path", output.display()),
            )
        })?
        .to_string_lossy()
        .into_owned();
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;
    let tmp = parent.join(format!(".{file_name}.{}.tmp", std::process::id()));

    let result = async {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, output).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    debug!("Wrote {} bytes to {}", data.len(), output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn missing_file_is_missing_artifact() {
        let dir = tempdir().unwrap();
        let err = load_embeddings(&dir.path().join("nope.json")).await.unwrap_err();
        assert!(matches!(err, AppError::MissingArtifact(_)), "{err}");
    }

    #[tokio::test]
    async fn embeddings_survive_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("emb.json");
        let matrix = EmbeddingMatrix::from_rows(vec![vec![0.5, -2.25], vec![3.0, 4.0]]).unwrap();

        save_embeddings(&path, &matrix).await.unwrap();
        let loaded = load_embeddings(&path).await.unwrap();

        assert_eq!(loaded, matrix);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind");
    }

    #[tokio::test]
    async fn ragged_embeddings_are_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("emb.json");
        std::fs::write(
            &path,
            r#"{"format":"feedback-themes/embeddings","version":1,"created_at":"2025-01-01T00:00:00Z","shape":[2,2],"data":[[1.0,2.0],[3.0]]}"#,
        )
        .unwrap();
        let err = load_embeddings(&path).await.unwrap_err();
        assert!(matches!(err, AppError::MalformedArtifact { .. }), "{err}");
        assert!(err.to_string().contains("row 1"), "{err}");
    }

    #[tokio::test]
    async fn foreign_format_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("labels.json");
        std::fs::write(
            &path,
            r#"{"format":"feedback-themes/embeddings","version":1,"created_at":"2025-01-01T00:00:00Z","shape":[1],"k":1,"seed":0,"data":[0]}"#,
        )
        .unwrap();
        let err = load_labels(&path).await.unwrap_err();
        assert!(err.to_string().contains("expected 'feedback-themes/labels'"), "{err}");
    }

    #[tokio::test]
    async fn float_labels_are_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("labels.json");
        std::fs::write(
            &path,
            r#"{"format":"feedback-themes/labels","version":1,"created_at":"2025-01-01T00:00:00Z","shape":[2],"k":2,"seed":0,"data":[0,1.5]}"#,
        )
        .unwrap();
        let err = load_labels(&path).await.unwrap_err();
        match err {
            AppError::MalformedArtifact { reason, .. } => assert!(reason.contains("data[1]"), "{reason}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn out_of_range_labels_are_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("labels.json");
        std::fs::write(
            &path,
            r#"{"format":"feedback-themes/labels","version":1,"created_at":"2025-01-01T00:00:00Z","shape":[2],"k":2,"seed":0,"data":[0,2]}"#,
        )
        .unwrap();
        assert!(matches!(
            load_labels(&path).await,
            Err(AppError::MalformedArtifact { .. })
        ));
    }

    #[tokio::test]
    async fn feedback_must_be_strings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feedback.json");
        std::fs::write(&path, r#"["fine", 3]"#).unwrap();
        let err = load_feedback(&path).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)), "{err}");
        assert!(err.to_string().contains("item 1"), "{err}");

        std::fs::write(&path, r#"{"text": "fine"}"#).unwrap();
        assert!(matches!(
            load_feedback(&path).await,
            Err(AppError::MalformedArtifact { .. })
        ));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            load_feedback(&path).await,
            Err(AppError::MalformedArtifact { .. })
        ));
    }

    #[tokio::test]
    async fn annotated_must_be_a_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("annotated.json");
        std::fs::write(&path, r#"{"feedback_text": "x"}"#).unwrap();
        let err = load_annotated(&path).await.unwrap_err();
        assert!(err.to_string().contains("found an object"), "{err}");
    }
}
