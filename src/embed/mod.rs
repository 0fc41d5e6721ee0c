#[cfg(feature = "local-ml")]
pub(crate) mod bert;
pub(crate) mod hashing;
pub(crate) mod openai;
pub mod traits;

use async_openai::Client;
use async_openai::config::Config;
use tracing::{debug, info};

use crate::AppResult;
use crate::embed::traits::Embedder;
use crate::error::AppError;

#[cfg(feature = "local-ml")]
pub static DEFAULT_LOCAL_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub static DEFAULT_REMOTE_MODEL: &str = "text-embedding-nomic-embed-text-v1.5";
pub const DEFAULT_DIMENSIONS: usize = 384;

/// One fixed-length vector per feedback item, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingMatrix {
    rows: Vec<Vec<f32>>,
    dim: usize,
}

impl EmbeddingMatrix {
    /// Matrix with zero rows.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from rows, rejecting ragged or zero-width input.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self, String> {
        let Some(first) = rows.first() else {
            return Ok(Self::empty());
        };
        let dim = first.len();
        if dim == 0 {
            return Err("embedding vectors have zero dimensions".to_string());
        }
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != dim) {
            return Err(format!(
                "row {i} has {} dimensions, row 0 has {dim}",
                row.len()
            ));
        }
        Ok(Self { rows, dim })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Embedding dimensionality; zero for an empty matrix.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn rows(&self) -> &[Vec<f32>] {
        &self.rows
    }
}

/// Which embedding backend to run.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedderKind {
    /// Model-free feature hashing of words and word pairs
    #[default]
    Hashing,
    /// Local sentence-transformer model (requires the `local-ml` feature)
    Local,
    /// OpenAI-compatible embeddings server
    #[value(name = "openai")]
    OpenAI,
}

/// Everything needed to construct an embedder.
pub struct EmbedOptions<C: Config> {
    pub kind: EmbedderKind,
    pub model: Option<String>,
    pub dimensions: usize,
    pub batch_size: usize,
    pub concurrency: usize,
    pub client: Client<C>,
}

/// Construct the configured backend.
///
/// Fails with [`AppError::ModelUnavailable`] when the backend cannot be initialised.
#[tracing::instrument(name = "Initialising embedder", level = "info", skip(opts))]
pub async fn build_embedder<C: Config + Send + Sync + 'static>(
    opts: EmbedOptions<C>,
) -> AppResult<Box<dyn Embedder>> {
    let embedder: Box<dyn Embedder> = match opts.kind {
        EmbedderKind::Hashing => Box::new(hashing::HashingEmbedder::new(opts.dimensions)?),
        EmbedderKind::OpenAI => Box::new(openai::OAIEmbedder::new(
            opts.client,
            opts.model
                .unwrap_or_else(|| DEFAULT_REMOTE_MODEL.to_string()),
            opts.batch_size,
            opts.concurrency,
        )?),
        #[cfg(feature = "local-ml")]
        EmbedderKind::Local => Box::new(
            bert::BertEmbedder::new_from_pretrained(
                opts.model.as_deref().unwrap_or(DEFAULT_LOCAL_MODEL),
            )
            .await?,
        ),
        #[cfg(not(feature = "local-ml"))]
        EmbedderKind::Local => {
            return Err(AppError::ModelUnavailable(
                "this build does not include the local model backend; rebuild with `--features local-ml`"
                    .to_string(),
            ));
        }
    };
    info!("Using {} embedder", embedder.name());
    Ok(embedder)
}

/// Encode `texts` into an [`EmbeddingMatrix`], row `i` belonging to `texts[i]`.
///
/// Empty input yields an empty matrix without calling the backend.
#[tracing::instrument(name = "Encoding feedback", level = "info", skip_all, fields(n = texts.len()))]
pub async fn encode<E: Embedder + ?Sized>(embedder: &E, texts: &[String]) -> AppResult<EmbeddingMatrix> {
    if texts.is_empty() {
        debug!("No texts to encode");
        return Ok(EmbeddingMatrix::empty());
    }
    let rows = embedder.embed(texts).await?;
    if rows.len() != texts.len() {
        return Err(AppError::EmbeddingFailed(format!(
            "{} returned {} vectors for {} texts",
            embedder.name(),
            rows.len(),
            texts.len()
        )));
    }
    let matrix = EmbeddingMatrix::from_rows(rows).map_err(AppError::EmbeddingFailed)?;
    info!("Encoded {} texts into {} dimensions", matrix.len(), matrix.dim());
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use futures::future::BoxFuture;

    use super::*;

    struct Fixed(Vec<Vec<f32>>);

    impl Embedder for Fixed {
        fn embed<'a>(&'a self, _texts: &'a [String]) -> BoxFuture<'a, AppResult<Vec<Vec<f32>>>> {
            async move { Ok(self.0.clone()) }.boxed()
        }

        fn name(&self) -> String {
            "fixed".to_string()
        }
    }

    struct Unreachable;

    impl Embedder for Unreachable {
        fn embed<'a>(&'a self, _texts: &'a [String]) -> BoxFuture<'a, AppResult<Vec<Vec<f32>>>> {
            async move { panic!("backend must not be called") }.boxed()
        }

        fn name(&self) -> String {
            "unreachable".to_string()
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn empty_input_skips_backend() {
        let matrix = encode(&Unreachable, &[]).await.unwrap();
        assert!(matrix.is_empty());
        assert_eq!(matrix.dim(), 0);
    }

    #[tokio::test]
    async fn wrong_row_count_is_rejected() {
        let backend = Fixed(vec![vec![1.0, 0.0]]);
        let err = encode(&backend, &texts(&["a", "b"])).await.unwrap_err();
        assert!(matches!(err, AppError::EmbeddingFailed(_)), "{err}");
    }

    #[tokio::test]
    async fn ragged_rows_are_rejected() {
        let backend = Fixed(vec![vec![1.0, 0.0], vec![1.0]]);
        let err = encode(&backend, &texts(&["a", "b"])).await.unwrap_err();
        assert!(err.to_string().contains("row 1"), "{err}");
    }

    #[test]
    fn zero_width_rows_are_rejected() {
        assert!(EmbeddingMatrix::from_rows(vec![vec![], vec![]]).is_err());
    }

    #[tokio::test]
    async fn local_backend_reports_unavailable_without_feature() {
        if cfg!(feature = "local-ml") {
            return;
        }
        let opts = EmbedOptions {
            kind: EmbedderKind::Local,
            model: None,
            dimensions: DEFAULT_DIMENSIONS,
            batch_size: 8,
            concurrency: 1,
            client: Client::new(),
        };
        let err = build_embedder(opts).await.err().unwrap();
        assert!(matches!(err, AppError::ModelUnavailable(_)), "{err}");
    }
}
