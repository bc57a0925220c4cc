use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Sampling rate every prompt must be stored at
pub const PCM_SAMPLING_RATE: u32 = 8000;

/// One prompt library: prompt id (the file name without extension) to
/// PCM samples
pub struct MediaRepo {
    name: String,
    prompts: RwLock<HashMap<String, Arc<Vec<i16>>>>,
}

impl MediaRepo {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, prompt: &str) -> Option<Arc<Vec<i16>>> {
        let prompts = self.prompts.read();
        let pcm = prompts.get(prompt)?;

        if pcm.is_empty() {
            return None;
        }

        Some(pcm.clone())
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.read().len()
    }
}

/// All prompt libraries, keyed by repository name. The called user part
/// of an INVITE selects the repository. Read-mostly after startup.
pub struct MediaRepoCollection {
    repos: RwLock<HashMap<String, Arc<MediaRepo>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum MediaLoadError {
    #[error("cannot read media directory {dir}: {source}")]
    UnreadableDir {
        dir: String,
        source: std::io::Error,
    },
}

impl MediaRepoCollection {
    /// Load every prompt file of `media_dir` into a repository named
    /// `repo_name`. Unsupported or broken files are logged and skipped.
    pub fn load(repo_name: &str, media_dir: &str) -> Result<Self, MediaLoadError> {
        let mut prompts = HashMap::new();

        let entries = std::fs::read_dir(media_dir).map_err(|source| {
            MediaLoadError::UnreadableDir {
                dir: media_dir.to_string(),
                source,
            }
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                continue;
            }

            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_ascii_lowercase();

            let pcm = match extension.as_str() {
                "raw" => read_pcm_raw(&path),
                "wav" => read_pcm_wav(&path),
                // mp3 and friends go through the external transcoder
                // before deployment
                other => {
                    tracing::warn!(
                        file = %path.display(),
                        "unsupported extension {other:?}, skipped"
                    );
                    continue;
                }
            };

            match pcm {
                Ok(pcm) => {
                    let duration_ms =
                        pcm.len() as u64 * 1000 / u64::from(PCM_SAMPLING_RATE);
                    tracing::info!(
                        prompt = stem,
                        duration_ms,
                        "loaded {}",
                        path.display()
                    );
                    prompts.insert(stem.to_string(), Arc::new(pcm));
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), "failed to load: {e}");
                }
            }
        }

        let repo = Arc::new(MediaRepo {
            name: repo_name.to_string(),
            prompts: RwLock::new(prompts),
        });

        let mut repos = HashMap::new();
        repos.insert(repo_name.to_string(), repo);

        Ok(Self {
            repos: RwLock::new(repos),
        })
    }

    pub fn get_repo(&self, name: &str) -> Option<Arc<MediaRepo>> {
        self.repos.read().get(name).cloned()
    }

    pub fn get(&self, repo: &str, prompt: &str) -> Option<Arc<Vec<i16>>> {
        self.get_repo(repo)?.get(prompt)
    }

    pub fn prompt_count(&self, repo: &str) -> Option<usize> {
        self.get_repo(repo).map(|repo| repo.prompt_count())
    }
}

/// Raw files are headerless 16-bit little-endian mono at 8 kHz
fn read_pcm_raw(path: &Path) -> anyhow::Result<Vec<i16>> {
    let bytes = std::fs::read(path)?;

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// WAV prompts must already be 16-bit mono at 8 kHz; anything else is
/// prepared by the external transcoder
fn read_pcm_wav(path: &Path) -> anyhow::Result<Vec<i16>> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    if spec.channels != 1 || spec.sample_rate != PCM_SAMPLING_RATE || spec.bits_per_sample != 16 {
        anyhow::bail!(
            "expected 16-bit mono {PCM_SAMPLING_RATE} Hz, got {}-bit {}ch {} Hz",
            spec.bits_per_sample,
            spec.channels,
            spec.sample_rate
        );
    }

    Ok(reader.samples::<i16>().collect::<Result<_, _>>()?)
}

#[cfg(test)]
mod test {
    use super::*;

    fn write_raw(dir: &Path, name: &str, samples: &[i16]) {
        let mut bytes = Vec::new();
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    #[test]
    fn load_raw_prompts() {
        let dir = std::env::temp_dir().join("mrfd-media-test-raw");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        write_raw(&dir, "greeting.raw", &[0, 1, -1, 32767, -32768]);
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let repos =
            MediaRepoCollection::load("3001", dir.to_str().unwrap()).unwrap();

        assert_eq!(repos.prompt_count("3001"), Some(1));
        let pcm = repos.get("3001", "greeting").unwrap();
        assert_eq!(pcm.as_ref(), &vec![0, 1, -1, 32767, -32768]);

        assert!(repos.get("3001", "missing").is_none());
        assert!(repos.get_repo("9999").is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_dir_fails() {
        assert!(MediaRepoCollection::load("x", "/definitely/not/here-mrfd").is_err());
    }
}
