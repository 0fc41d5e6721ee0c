use futures::future::BoxFuture;

use crate::AppResult;

/// Trait for converting text into vector embeddings.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts.
    /// Returns one vector per input text, in input order.
    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, AppResult<Vec<Vec<f32>>>>;

    /// Short name used in logs.
    fn name(&self) -> String;
}
