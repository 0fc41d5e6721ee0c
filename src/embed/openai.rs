use async_openai::types::embeddings::CreateEmbeddingRequestArgs;
use async_openai::{Client, config::Config};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryStreamExt, stream};
use tracing::{debug, info_span};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::style::ProgressStyle;

use crate::AppResult;
use crate::embed::traits::Embedder;
use crate::error::AppError;

/// Embedding implementation that talks to an OpenAI-compatible server.
///
/// Texts are sent in batches; up to `concurrency` batches are in flight and the
/// results are reassembled in input order.
pub struct OAIEmbedder<C: Config> {
    client: Client<C>,
    model: String,
    batch_size: usize,
    concurrency: usize,
}

impl<C: Config> OAIEmbedder<C> {
    pub fn new(
        client: Client<C>,
        model: String,
        batch_size: usize,
        concurrency: usize,
    ) -> AppResult<Self> {
        if batch_size == 0 || concurrency == 0 {
            return Err(AppError::ModelUnavailable(
                "batch size and concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            client,
            model,
            batch_size,
            concurrency,
        })
    }

    async fn embed_batch(&self, batch: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(batch.to_vec())
            .build()
            .map_err(|e| AppError::EmbeddingFailed(e.to_string()))?;

        let response = self.client.embeddings().create(request).await?;

        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        debug!("Received {} vectors for a batch of {}", data.len(), batch.len());
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

impl<C: Config> Embedder for OAIEmbedder<C> {
    fn embed<'e>(&'e self, texts: &'e [String]) -> BoxFuture<'e, AppResult<Vec<Vec<f32>>>> {
        async move {
            let header_span = info_span!("Requesting embeddings");
            header_span.pb_set_message("Embedding...");
            header_span.pb_set_finish_message("Embedding complete");
            header_span.pb_set_length(texts.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            {
                header_span.pb_set_style(&style);
            }

            let batches: Vec<Vec<Vec<f32>>> = stream::iter(texts.chunks(self.batch_size))
                .map(|batch| {
                    let span = header_span.clone();
                    async move {
                        let vectors = self.embed_batch(batch).await?;
                        span.pb_inc(batch.len() as u64);
                        AppResult::Ok(vectors)
                    }
                })
                .boxed()
                .buffered(self.concurrency)
                .try_collect()
                .await?;

            Ok(batches.into_iter().flatten().collect())
        }
        .boxed()
    }

    fn name(&self) -> String {
        format!("OpenAI-compatible ({})", self.model)
    }
}
