//! Local sentence encoder for feedback embeddings.
//!
//! Loads a BERT-family model (safetensors weights, `config.json`, `tokenizer.json`)
//! from the Hugging Face hub into the user cache, runs it with candle and returns
//! mean-pooled, L2-normalised sentence vectors.

mod cache;

use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use futures::StreamExt;
use tokenizers::tokenizer::Tokenizer;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::style::ProgressStyle;

pub use cache::{VectorCache, cache_root, model_dir};

static MODEL_FILES: [&str; 3] = ["config.json", "model.safetensors", "tokenizer.json"];

#[derive(thiserror::Error, Debug)]
pub enum EmbedderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Download error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Download of {url} failed with status {status}")]
    Download { url: String, status: u16 },
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error("Vector cache decode error: {0}")]
    Bincode(#[from] bincode::error::DecodeError),
    #[error("Vector cache encode error: {0}")]
    BincodeEncode(#[from] bincode::error::EncodeError),
    #[error("Int parse error: {0}")]
    ParseInt(#[from] std::num::ParseIntError),
    #[error("Header value error: {0}")]
    HeaderValue(#[from] reqwest::header::ToStrError),
    #[error("Cache directory not found: {0}")]
    CacheDir(String),
    #[error("Worker thread failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, EmbedderError>;

/// BERT encoder with mean pooling, shared cheaply between tasks.
#[derive(Clone)]
pub struct SentenceEncoder {
    device: Device,
    model: Arc<BertModel>,
    tokenizer: Arc<Tokenizer>,
    cache: VectorCache,
}

impl SentenceEncoder {
    fn create_device() -> Result<Device> {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            Ok(Device::new_metal(0)?)
        }

        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            Ok(Device::Cpu)
        }
    }

    /// Download (if needed) and load `model_name` from the Hugging Face hub.
    #[tracing::instrument(name = "Fetching embedding model", level = "info")]
    pub async fn new_from_pretrained(model_name: &str) -> Result<Self> {
        let dir = model_dir(model_name)?;
        tokio::fs::create_dir_all(&dir).await?;
        download_missing(model_name, &dir).await?;
        Self::new_from_dir(&dir, model_name)
    }

    /// Load a model whose files already sit in `dir`.
    #[tracing::instrument(name = "Loading embedding model", level = "info", skip(dir))]
    pub fn new_from_dir<P: AsRef<Path>>(dir: P, model_name: &str) -> Result<Self> {
        let dir = dir.as_ref();

        let tokenizer = Tokenizer::from_file(dir.join("tokenizer.json"))
            .map_err(|e| EmbedderError::Tokenizer(e.to_string()))?;

        let config_bytes = std::fs::read(dir.join("config.json"))?;
        let config: BertConfig = serde_json::from_slice(&config_bytes)?;

        let device = Self::create_device()?;
        let weights = std::fs::read(dir.join("model.safetensors"))?;
        let vb = VarBuilder::from_slice_safetensors(&weights, DType::F32, &device)?;
        let model = BertModel::load(vb, &config)?;

        Ok(Self {
            device,
            model: Arc::new(model),
            tokenizer: Arc::new(tokenizer),
            cache: VectorCache::open(model_name)?,
        })
    }

    /// Encode one text. Results are cached on disk per model.
    pub fn embed_text_blocking(&self, text: &str) -> Result<Vec<f32>> {
        let text = text.trim();
        if let Some(hit) = self.cache.get(text)? {
            return Ok(hit);
        }

        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EmbedderError::Tokenizer(e.to_string()))?;
        let seq_len = encoding.get_ids().len();

        let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.reshape((1, seq_len))?;
        let token_type_ids =
            Tensor::new(encoding.get_type_ids(), &self.device)?.reshape((1, seq_len))?;
        let attention_mask =
            Tensor::new(encoding.get_attention_mask(), &self.device)?.reshape((1, seq_len))?;

        // (1, seq_len, hidden)
        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        // Mean over real tokens only, then L2-normalise.
        let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?;
        let mean = summed.broadcast_div(&counts)?;
        let norm = mean.sqr()?.sum_keepdim(1)?.sqrt()?;
        let embedding = mean.broadcast_div(&norm)?.squeeze(0)?.to_vec1::<f32>()?;

        self.cache.put(text, &embedding)?;
        Ok(embedding)
    }

    /// Encode many texts on a blocking worker; output order matches input order.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let encoder = self.clone();
        let texts: Vec<String> = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let header_span = info_span!("Embedding feedback");
            header_span.pb_set_message("Embedding...");
            header_span.pb_set_finish_message("Embedding complete");
            header_span.pb_set_length(texts.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            {
                header_span.pb_set_style(&style);
            }
            header_span.in_scope(|| {
                let mut embeddings = Vec::with_capacity(texts.len());
                for t in &texts {
                    embeddings.push(encoder.embed_text_blocking(t)?);
                    header_span.pb_inc(1);
                }
                Result::<_>::Ok(embeddings)
            })
        })
        .await?
    }
}

/// Fetch whichever model files are not yet in `dir`.
async fn download_missing(model_name: &str, dir: &Path) -> Result<()> {
    let base_url = format!("https://huggingface.co/{model_name}/resolve/main/");
    let client = reqwest::ClientBuilder::new()
        .user_agent(concat!("feedback-themes/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?;

    for file in MODEL_FILES {
        let target = dir.join(file);
        if target.exists() {
            continue;
        }
        let url = format!("{base_url}{file}");
        download_file(&client, &url, &target).await?;
    }
    Ok(())
}

async fn download_file(client: &reqwest::Client, url: &str, target: &Path) -> Result<()> {
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        return Err(EmbedderError::Download {
            url: url.to_string(),
            status: resp.status().as_u16(),
        });
    }

    let header_span = info_span!("Downloading model file", url = %url);
    header_span.pb_set_message("Downloading...");
    header_span.pb_set_finish_message("Download complete");
    if let Some(content_length) = resp.headers().get(reqwest::header::CONTENT_LENGTH) {
        let file_size: u64 = content_length.to_str()?.parse()?;
        debug!("Expected file size: {} bytes", file_size);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        {
            header_span.pb_set_style(&style);
        }
        header_span.pb_set_length(file_size);
    } else {
        warn!("Content-Length header not found.");
        if let Ok(style) = ProgressStyle::default_spinner().template("{msg} {spinner}") {
            header_span.pb_set_style(&style);
        }
    }

    // Stream into a partial file so an interrupted download is never mistaken for a model file.
    let partial = target.with_extension("part");
    let mut out = tokio::fs::File::create(&partial).await?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        out.write_all(&chunk).await?;
        header_span.pb_inc(chunk.len() as u64);
    }
    out.flush().await?;
    out.sync_all().await?;
    drop(out);
    tokio::fs::rename(&partial, target).await?;
    Ok(())
}
