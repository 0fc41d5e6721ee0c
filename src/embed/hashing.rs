//! Model-free embedder based on signed feature hashing.
//!
//! Each lower-cased word unigram and adjacent-word bigram is hashed with murmur3
//! into one of `dimensions` buckets; a second hash picks the sign. The vector is
//! L2-normalised so Euclidean distance tracks cosine similarity.

use std::io::Cursor;

use futures::FutureExt;
use futures::future::BoxFuture;
use murmur3::murmur3_32;
use tracing::info_span;
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::style::ProgressStyle;

use crate::AppResult;
use crate::embed::traits::Embedder;
use crate::error::AppError;

const BUCKET_SEED: u32 = 0x5eed_0001;
const SIGN_SEED: u32 = 0x5eed_0002;

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> AppResult<Self> {
        if dimensions == 0 {
            return Err(AppError::ModelUnavailable(
                "hashing embedder needs at least one dimension".to_string(),
            ));
        }
        Ok(Self { dimensions })
    }

    pub fn embed_text(&self, text: &str) -> AppResult<Vec<f32>> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for feature in features(text) {
            let bucket = murmur3_32(&mut Cursor::new(feature.as_bytes()), BUCKET_SEED)?;
            let sign = murmur3_32(&mut Cursor::new(feature.as_bytes()), SIGN_SEED)?;
            let idx = bucket as usize % self.dimensions;
            vector[idx] += if sign & 1 == 0 { 1.0 } else { -1.0 };
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn features(text: &str) -> Vec<String> {
    let tokens = tokens(text);
    let bigrams = tokens.windows(2).map(|w| format!("{} {}", w[0], w[1]));
    tokens.iter().cloned().chain(bigrams).collect()
}

impl Embedder for HashingEmbedder {
    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, AppResult<Vec<Vec<f32>>>> {
        async move {
            let header_span = info_span!("Hashing feedback");
            header_span.pb_set_message("Embedding...");
            header_span.pb_set_finish_message("Embedding complete");
            header_span.pb_set_length(texts.len() as u64);
            if let Ok(style) =
                ProgressStyle::default_bar().template("{msg} [{bar:40.cyan/blue}] {pos}/{len}")
            {
                header_span.pb_set_style(&style);
            }
            header_span.in_scope(|| {
                let mut out = Vec::with_capacity(texts.len());
                for text in texts {
                    out.push(self.embed_text(text)?);
                    header_span.pb_inc(1);
                }
                Ok::<_, AppError>(out)
            })
        }
        .boxed()
    }

    fn name(&self) -> String {
        format!("feature-hashing ({} dimensions)", self.dimensions)
    }
}
