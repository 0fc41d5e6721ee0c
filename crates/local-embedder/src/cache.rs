use std::env;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use murmur3::murmur3_x86_128;

use crate::{EmbedderError, Result};

/// Application name used to namespace the cache directory.
pub static APP_NAME: &str = "feedback-themes";

/// Resolve `$XDG_CACHE_HOME/feedback-themes`, falling back to `~/.cache/feedback-themes`.
pub fn cache_root() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CACHE_HOME") {
        Ok(PathBuf::from(dir).join(APP_NAME))
    } else if let Some(home_dir) = env::home_dir() {
        Ok(home_dir.join(".cache").join(APP_NAME))
    } else if let Ok(userprofile) = env::var("USERPROFILE") {
        Ok(PathBuf::from(userprofile).join(".cache").join(APP_NAME))
    } else {
        Err(EmbedderError::CacheDir(
            "set XDG_CACHE_HOME or HOME".to_string(),
        ))
    }
}

/// Directory holding downloaded files for `model_name`.
pub fn model_dir(model_name: &str) -> Result<PathBuf> {
    Ok(cache_root()?
        .join("huggingface")
        .join(model_name.replace('/', "_")))
}

/// Per-text vector cache, one bincode file per (model, text) pair.
#[derive(Debug, Clone)]
pub struct VectorCache {
    dir: PathBuf,
}

impl VectorCache {
    pub fn open(model_name: &str) -> Result<Self> {
        let dir = cache_root()?
            .join("vectors")
            .join(model_name.replace('/', "_"));
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[cfg(test)]
    fn at<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, text: &str) -> Result<PathBuf> {
        let key = murmur3_x86_128(&mut Cursor::new(text), 0)?;
        Ok(self.dir.join(format!("{key:032x}.bin")))
    }

    pub fn get(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let path = self.path_for(text)?;
        if !path.exists() {
            return Ok(None);
        }
        let reader = std::io::BufReader::new(std::fs::File::open(&path)?);
        let vec: Vec<f32> = bincode::decode_from_reader(reader, bincode::config::standard())?;
        Ok(Some(vec))
    }

    pub fn put(&self, text: &str, vector: &[f32]) -> Result<()> {
        let path = self.path_for(text)?;
        let tmp = path.with_extension("tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            bincode::encode_into_std_write(vector, &mut f, bincode::config::standard())?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_reads_back_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VectorCache::at(dir.path());

        assert_eq!(cache.get("hello").unwrap(), None);
        cache.put("hello", &[0.25, -1.0]).unwrap();
        assert_eq!(cache.get("hello").unwrap(), Some(vec![0.25, -1.0]));
        assert_eq!(cache.get("other").unwrap(), None);
        assert_eq!(cache.dir(), dir.path());
    }

    #[test]
    fn model_names_become_single_path_segments() {
        let dir = model_dir("sentence-transformers/all-MiniLM-L6-v2").unwrap();
        assert!(dir.ends_with("huggingface/sentence-transformers_all-MiniLM-L6-v2"));
    }
}
