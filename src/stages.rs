//! The four pipeline stages. Each stage reads its inputs from disk and persists its
//! output before returning, so any stage can be re-run on its own.

use std::path::Path;

use async_openai::config::Config;
use tracing::{debug, info};

use crate::artifact::{self, ArtifactPaths};
use crate::cluster::{self, Clusterer, LabelVector};
use crate::embed::{self, EmbedOptions, EmbeddingMatrix};
use crate::error::{AppError, AppResult};
use crate::report::{self, ThemeReport};
use crate::themes::{self, Annotation, ThemeMap};

/// Records logged after annotation, for a quick look without opening the file.
const PREVIEW_RECORDS: usize = 5;

/// Vectorize the feedback source into the embedding artifact.
///
/// The backend is only initialised when there is something to encode.
#[tracing::instrument(name = "Embedding stage", level = "info", skip(opts))]
pub async fn embed_stage<C: Config + Send + Sync + 'static>(
    paths: &ArtifactPaths,
    opts: EmbedOptions<C>,
) -> AppResult<EmbeddingMatrix> {
    let texts = artifact::load_feedback(&paths.feedback).await?;
    let matrix = if texts.is_empty() {
        info!("Feedback source is empty, writing an empty embedding matrix");
        EmbeddingMatrix::empty()
    } else {
        let embedder = embed::build_embedder(opts).await?;
        embed::encode(embedder.as_ref(), &texts).await?
    };
    artifact::save_embeddings(&paths.embeddings, &matrix).await?;
    info!(
        "Saved {}x{} embeddings to {}",
        matrix.len(),
        matrix.dim(),
        paths.embeddings.display()
    );
    Ok(matrix)
}

/// Cluster the embedding artifact into the label artifact.
///
/// Nothing is written when clustering fails.
#[tracing::instrument(name = "Clustering stage", level = "info", skip(clusterer))]
pub async fn cluster_stage<C: Clusterer + ?Sized>(
    paths: &ArtifactPaths,
    clusterer: &C,
    k: usize,
    seed: u64,
) -> AppResult<LabelVector> {
    if k == 0 {
        return Err(AppError::InvalidInput(
            "cluster count must be at least 1".to_string(),
        ));
    }
    let matrix = artifact::load_embeddings(&paths.embeddings).await?;
    let labels = if matrix.is_empty() {
        info!("Embedding matrix is empty, writing an empty label vector");
        LabelVector::empty(k, seed).map_err(AppError::InvalidInput)?
    } else {
        cluster::fit(clusterer, &matrix, k, seed)?
    };
    artifact::save_labels(&paths.labels, &labels).await?;
    info!("Saved {} labels to {}", labels.len(), paths.labels.display());
    Ok(labels)
}

/// Render sample feedback per cluster, optionally writing a theme-map template.
#[tracing::instrument(name = "Review stage", level = "info")]
pub async fn review_stage(
    paths: &ArtifactPaths,
    samples_per_cluster: usize,
    template: Option<&Path>,
) -> AppResult<String> {
    let texts = artifact::load_feedback(&paths.feedback).await?;
    let labels = artifact::load_labels(&paths.labels).await?;
    let samples = themes::summarize(&texts, labels.as_slice(), samples_per_cluster)?;
    if let Some(template) = template {
        artifact::write_json_atomic(template, &ThemeMap::template(labels.as_slice())).await?;
        info!("Wrote theme map template to {}", template.display());
    }
    Ok(themes::render_samples(&samples, labels.as_slice()))
}

/// Apply `theme_map` and persist the annotated output.
#[tracing::instrument(name = "Annotation stage", level = "info", skip(theme_map))]
pub async fn annotate_stage(paths: &ArtifactPaths, theme_map: &ThemeMap) -> AppResult<Annotation> {
    let texts = artifact::load_feedback(&paths.feedback).await?;
    let labels = artifact::load_labels(&paths.labels).await?;
    let annotation = themes::annotate(&texts, labels.as_slice(), theme_map)?;
    artifact::save_annotated(&paths.annotated, &annotation.records).await?;
    info!(
        "Saved {} annotated records to {}",
        annotation.records.len(),
        paths.annotated.display()
    );
    if !annotation.unmapped.is_empty() || !annotation.unused.is_empty() {
        info!(
            "{} of {} clusters have no theme, {} theme map entries unused",
            annotation.unmapped.len(),
            cluster::cluster_sizes(labels.as_slice()).len(),
            annotation.unused.len()
        );
    }
    for record in annotation.records.iter().take(PREVIEW_RECORDS) {
        debug!(
            "[{}] {} <- {}",
            record.cluster_id, record.theme_label, record.feedback_text
        );
    }
    Ok(annotation)
}

/// Build the report from the annotated output.
#[tracing::instrument(name = "Report stage", level = "info")]
pub async fn report_stage(paths: &ArtifactPaths) -> AppResult<ThemeReport> {
    let records = artifact::load_annotated(&paths.annotated).await?;
    let report = report::render(&records);
    info!(
        "{} records in {} themes, {} skipped",
        report.total(),
        report.sections.len(),
        report.skipped.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use async_openai::Client;
    use async_openai::config::OpenAIConfig;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::cluster::KMeansClusterer;
    use crate::embed::{DEFAULT_DIMENSIONS, EmbedderKind};

    fn hashing() -> EmbedOptions<OpenAIConfig> {
        EmbedOptions {
            kind: EmbedderKind::Hashing,
            model: None,
            dimensions: DEFAULT_DIMENSIONS,
            batch_size: 16,
            concurrency: 1,
            client: Client::new(),
        }
    }

    fn unavailable() -> EmbedOptions<OpenAIConfig> {
        EmbedOptions {
            dimensions: 0,
            ..hashing()
        }
    }

    async fn workdir(feedback: &str) -> (TempDir, ArtifactPaths) {
        let dir = tempdir().unwrap();
        let paths = ArtifactPaths::in_dir(dir.path());
        tokio::fs::write(&paths.feedback, feedback).await.unwrap();
        (dir, paths)
    }

    fn theme_map(entries: &[(usize, &str)]) -> ThemeMap {
        let mut map = ThemeMap::new();
        for (id, name) in entries {
            map.insert(*id, *name).unwrap();
        }
        map
    }

    #[tokio::test]
    async fn full_pipeline_scenario() {
        let (_dir, paths) = workdir(r#"["great UI", "support is slow", "great UI again"]"#).await;

        let matrix = embed_stage(&paths, hashing()).await.unwrap();
        assert_eq!((matrix.len(), matrix.dim()), (3, DEFAULT_DIMENSIONS));

        let labels = cluster_stage(&paths, &KMeansClusterer::default(), 2, 42)
            .await
            .unwrap();
        assert_eq!(labels.as_slice(), &[0, 1, 0]);

        let review = review_stage(&paths, 4, None).await.unwrap();
        assert!(review.contains("Cluster 0 (2 items):"));
        assert!(review.contains("Cluster 1 (1 items):"));

        let map = theme_map(&[(0, "Usability"), (1, "Support")]);
        let annotation = annotate_stage(&paths, &map).await.unwrap();
        assert!(annotation.unmapped.is_empty());

        let on_disk = artifact::load_annotated(&paths.annotated).await.unwrap();
        assert_eq!(on_disk[1]["feedback_text"], "support is slow");
        assert_eq!(on_disk[1]["cluster_id"], 1);
        assert_eq!(on_disk[1]["theme_label"], "Support");

        let report = report_stage(&paths).await.unwrap();
        let themes: Vec<(&str, usize)> = report
            .sections
            .iter()
            .map(|s| (s.theme.as_str(), s.count()))
            .collect();
        assert_eq!(themes, vec![("Support", 1), ("Usability", 2)]);
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn empty_feedback_flows_to_no_data_report() {
        let (_dir, paths) = workdir("[]").await;

        // An invalid backend proves it is never initialised for empty input.
        let matrix = embed_stage(&paths, unavailable()).await.unwrap();
        assert!(matrix.is_empty());
        let labels = cluster_stage(&paths, &KMeansClusterer::default(), 4, 42)
            .await
            .unwrap();
        assert!(labels.is_empty());
        let annotation = annotate_stage(&paths, &ThemeMap::new()).await.unwrap();
        assert!(annotation.records.is_empty());

        let report = report_stage(&paths).await.unwrap();
        assert!(report.to_string().contains("No feedback data to report."));
    }

    #[tokio::test]
    async fn zero_clusters_is_rejected_even_for_empty_input() {
        let (_dir, paths) = workdir("[]").await;
        embed_stage(&paths, hashing()).await.unwrap();

        let err = cluster_stage(&paths, &KMeansClusterer::default(), 0, 42)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)), "{err}");
        assert!(!paths.labels.exists());
    }

    #[tokio::test]
    async fn too_few_rows_leave_no_label_artifact() {
        let (_dir, paths) = workdir(r#"["only one", "and two"]"#).await;
        embed_stage(&paths, hashing()).await.unwrap();

        let err = cluster_stage(&paths, &KMeansClusterer::default(), 4, 42)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::InsufficientSamples { samples: 2, k: 4 }
        ));
        assert!(!paths.labels.exists());
    }

    #[tokio::test]
    async fn missing_inputs_are_reported() {
        let dir = tempdir().unwrap();
        let paths = ArtifactPaths::in_dir(dir.path());
        let err = embed_stage(&paths, hashing()).await.unwrap_err();
        assert!(matches!(err, AppError::MissingArtifact(ref p) if p == &paths.feedback));
        let err = report_stage(&paths).await.unwrap_err();
        assert!(matches!(err, AppError::MissingArtifact(_)));
    }

    #[tokio::test]
    async fn edited_feedback_is_a_schema_mismatch() {
        let (_dir, paths) = workdir(r#"["a b", "c d", "e f"]"#).await;
        embed_stage(&paths, hashing()).await.unwrap();
        cluster_stage(&paths, &KMeansClusterer::default(), 2, 1)
            .await
            .unwrap();

        tokio::fs::write(&paths.feedback, r#"["a b", "c d"]"#)
            .await
            .unwrap();
        let err = annotate_stage(&paths, &ThemeMap::new()).await.unwrap_err();
        assert!(matches!(err, AppError::SchemaMismatch(_)), "{err}");
        assert!(!paths.annotated.exists());
    }

    #[tokio::test]
    async fn review_writes_template() {
        let (_dir, paths) = workdir(r#"["x y", "z w", "x y z"]"#).await;
        embed_stage(&paths, hashing()).await.unwrap();
        cluster_stage(&paths, &KMeansClusterer::default(), 2, 42)
            .await
            .unwrap();

        let template = paths.feedback.with_file_name("themes.json");
        review_stage(&paths, 1, Some(&template)).await.unwrap();
        let map = ThemeMap::load(&template).await.unwrap();
        assert_eq!(map.cluster_ids().count(), 2);
        assert_eq!(map.get(0), Some(themes::placeholder_theme(0).as_str()));
    }
}
