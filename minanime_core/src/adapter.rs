use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use md5::{Digest, Md5};
use tracing::info;

const DOWNLOAD_CHUNK_SIZE: usize = 8192;

/// A remote style adapter: where to fetch it, what to call it on disk, and
/// the truncated digest it must match.
#[derive(Debug, Clone)]
pub struct AdapterSpec {
    pub url: String,
    pub filename: String,
    pub hash_prefix: String,
}

impl AdapterSpec {
    /// The minimalist-anime style pack this tool ships with.
    pub fn minimalist_anime() -> Self {
        Self {
            url: "https://civitai.com/api/download/models/29709?type=Model&format=SafeTensor&size=full&fp=fp16"
                .to_string(),
            filename: "minimalist_anime_style.safetensors".to_string(),
            hash_prefix: "F16F6504EF".to_string(),
        }
    }
}

/// Errors from [`ensure_adapter`]. A network problem here aborts pipeline
/// construction; there is no retry.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("adapter request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("adapter download returned status {status} for {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Make sure a verified copy of the adapter exists under `model_dir` and
/// return its path.
///
/// An existing file whose truncated digest matches the spec is returned
/// without touching the network. A missing or mismatching file triggers a
/// streamed download that overwrites the target; a download that dies
/// partway leaves a truncated file which fails verification and is
/// replaced on the next run.
pub fn ensure_adapter(spec: &AdapterSpec, model_dir: &Path) -> Result<PathBuf, FetchError> {
    fs::create_dir_all(model_dir)?;
    let target = model_dir.join(&spec.filename);

    if target.exists() {
        if hash_prefix(&target)? == spec.hash_prefix {
            info!("adapter already present and verified: {}", target.display());
            return Ok(target);
        }
        info!("adapter exists but hash mismatch, redownloading");
    }

    download(&spec.url, &target)?;
    info!("adapter downloaded to {}", target.display());
    Ok(target)
}

/// First 10 upper-case hex characters of the file's MD5 digest.
///
/// An integrity smoke-check for the style pack, not a security control;
/// the prefix is collision-prone and deliberately kept as-is.
pub fn hash_prefix(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; DOWNLOAD_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    let mut hex = String::with_capacity(32);
    for byte in hasher.finalize() {
        hex.push_str(&format!("{byte:02X}"));
    }
    hex.truncate(10);
    Ok(hex)
}

fn download(url: &str, target: &Path) -> Result<(), FetchError> {
    info!("downloading adapter from {url}");
    let client = reqwest::blocking::Client::builder().timeout(None).build()?;
    let mut response = client.get(url).send()?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            status,
            url: url.to_string(),
        });
    }

    let bar = match response.content_length() {
        Some(length) => ProgressBar::new(length),
        None => ProgressBar::new_spinner(),
    };
    let mut file = File::create(target)?;
    let mut buf = [0u8; DOWNLOAD_CHUNK_SIZE];
    loop {
        let read = response.read(&mut buf)?;
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read])?;
        bar.inc(read as u64);
    }
    bar.finish_and_clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("minanime-adapter-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn spec_for(dir: &Path, contents: &[u8], hash_prefix: &str) -> AdapterSpec {
        let spec = AdapterSpec {
            // Unroutable on any sane machine, so a network attempt fails fast.
            url: "http://127.0.0.1:1/adapter.safetensors".to_string(),
            filename: "adapter.safetensors".to_string(),
            hash_prefix: hash_prefix.to_string(),
        };
        fs::write(dir.join(&spec.filename), contents).unwrap();
        spec
    }

    #[test]
    fn hash_prefix_is_truncated_uppercase_md5() {
        let dir = scratch_dir("hash");
        let path = dir.join("data.bin");
        fs::write(&path, b"hello world").unwrap();
        // md5("hello world") = 5eb63bbbe01eeed093cb22bb8f5acdc3
        assert_eq!(hash_prefix(&path).unwrap(), "5EB63BBBE0");

        fs::write(&path, b"").unwrap();
        assert_eq!(hash_prefix(&path).unwrap(), "D41D8CD98F");
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn verified_file_short_circuits_the_network() {
        let dir = scratch_dir("verified");
        let spec = spec_for(&dir, b"hello world", "5EB63BBBE0");
        // The URL is unreachable, so reaching the network would error out.
        let path = ensure_adapter(&spec, &dir).unwrap();
        assert_eq!(path, dir.join("adapter.safetensors"));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn hash_mismatch_triggers_a_download() {
        let dir = scratch_dir("mismatch");
        let spec = spec_for(&dir, b"corrupted", "5EB63BBBE0");
        match ensure_adapter(&spec, &dir) {
            Err(FetchError::Transport(_)) | Err(FetchError::Io(_)) => {}
            other => panic!("expected a download failure, got {other:?}"),
        }
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_triggers_a_download() {
        let dir = scratch_dir("missing");
        let spec = AdapterSpec {
            url: "http://127.0.0.1:1/adapter.safetensors".to_string(),
            filename: "adapter.safetensors".to_string(),
            hash_prefix: "5EB63BBBE0".to_string(),
        };
        assert!(ensure_adapter(&spec, &dir).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }
}
