use feedback_themes_local_embedder::SentenceEncoder;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::AppResult;
use crate::embed::traits::Embedder;
use crate::error::AppError;

/// Sentence encoder running locally through candle.
#[derive(Clone)]
pub struct BertEmbedder {
    inner: SentenceEncoder,
    model_name: String,
}

impl Embedder for BertEmbedder {
    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, AppResult<Vec<Vec<f32>>>> {
        async move { Ok(self.inner.embed_texts(texts).await?) }.boxed()
    }

    fn name(&self) -> String {
        format!("local sentence encoder ({})", self.model_name)
    }
}

impl BertEmbedder {
    /// Load `model_name` from the Hugging Face hub, downloading it on first use.
    #[tracing::instrument(name = "Loading local embedding model", level = "info")]
    pub async fn new_from_pretrained(model_name: &str) -> AppResult<Self> {
        let inner = SentenceEncoder::new_from_pretrained(model_name)
            .await
            .map_err(|e| AppError::ModelUnavailable(format!("{model_name}: {e}")))?;
        Ok(Self {
            inner,
            model_name: model_name.to_string(),
        })
    }
}
