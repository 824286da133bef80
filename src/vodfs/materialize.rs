//! VOD materializers
//!
//! How synthetic files get their bytes. The filesystem layer never inspects
//! which variant it holds:
//! - stub: every open fails "not ready" (the tree is browsable, content is
//!   not available)
//! - cache: first open of a direct-file URL downloads it into the cache
//!   directory; later reads come from disk. HLS URLs are never cached, the
//!   cache only makes sense for random-access files.
//!
//! Called from FUSE kernel threads, so everything here is synchronous.

use std::fs::File;
use std::io::{Read, Seek};
use std::path::PathBuf;

use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("content not ready")]
    NotReady,

    #[error("download failed: {0}")]
    Download(String),

    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Readable, seekable content handle. FUSE reads are offset-addressed, so
/// every materialized file must support seeking.
pub trait VodContent: Read + Seek + Send {}
impl<T: Read + Seek + Send> VodContent for T {}

/// Capability interface: turn a catalog entry into readable bytes.
pub trait Materializer: Send + Sync {
    /// Open the content of `id` backed by `url` for reading.
    fn open(&self, id: &str, url: &str) -> Result<Box<dyn VodContent>, MaterializeError>;

    /// Size when known (cached files); None means the caller reports a
    /// placeholder.
    fn known_size(&self, id: &str) -> Option<u64>;
}

/// Content is never available; the tree is metadata only.
pub struct StubMaterializer;

impl Materializer for StubMaterializer {
    fn open(&self, _id: &str, _url: &str) -> Result<Box<dyn VodContent>, MaterializeError> {
        Err(MaterializeError::NotReady)
    }

    fn known_size(&self, _id: &str) -> Option<u64> {
        None
    }
}

/// On-demand download cache for direct-file URLs.
pub struct CacheMaterializer {
    cache_dir: PathBuf,
}

fn is_hls_url(url: &str) -> bool {
    let path = url.split('?').next().unwrap_or(url);
    path.ends_with(".m3u8") || path.ends_with(".m3u")
}

impl CacheMaterializer {
    pub fn new(cache_dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    fn cache_path(&self, id: &str) -> PathBuf {
        // ids are catalog-generated ("vod-123", "ep-456"), safe as filenames
        self.cache_dir.join(id)
    }

    /// Download into a temp file, then rename, so partial downloads never
    /// look like cached content.
    fn download(&self, id: &str, url: &str) -> Result<(), MaterializeError> {
        let target = self.cache_path(id);
        let partial = target.with_extension("partial");

        info!(id, "materializing vod entry");
        let mut response = reqwest::blocking::Client::builder()
            .timeout(None::<std::time::Duration>)
            .build()
            .map_err(|e| MaterializeError::Download(e.to_string()))?
            .get(url)
            .send()
            .map_err(|e| MaterializeError::Download(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MaterializeError::Download(format!(
                "http {}",
                response.status().as_u16()
            )));
        }

        let mut file = File::create(&partial)?;
        if let Err(e) = std::io::copy(&mut response, &mut file) {
            let _ = std::fs::remove_file(&partial);
            return Err(e.into());
        }
        file.sync_all()?;
        drop(file);
        std::fs::rename(&partial, &target)?;
        info!(id, size = std::fs::metadata(&target).map(|m| m.len()).unwrap_or(0), "vod entry cached");
        Ok(())
    }
}

impl Materializer for CacheMaterializer {
    fn open(&self, id: &str, url: &str) -> Result<Box<dyn VodContent>, MaterializeError> {
        if is_hls_url(url) {
            // Segmented content has no random access to cache
            warn!(id, "hls vod entry cannot be cached");
            return Err(MaterializeError::NotReady);
        }

        let path = self.cache_path(id);
        if !path.exists() {
            self.download(id, url)?;
        }
        Ok(Box::new(File::open(path)?))
    }

    fn known_size(&self, id: &str) -> Option<u64> {
        std::fs::metadata(self.cache_path(id)).ok().map(|m| m.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_never_ready() {
        let stub = StubMaterializer;
        assert!(matches!(
            stub.open("vod-1", "http://host/movie.mp4"),
            Err(MaterializeError::NotReady)
        ));
        assert!(stub.known_size("vod-1").is_none());
    }

    #[test]
    fn test_hls_detection() {
        assert!(is_hls_url("http://host/x/index.m3u8"));
        assert!(is_hls_url("http://host/x/index.m3u8?token=1"));
        assert!(!is_hls_url("http://host/movie.mp4"));
        assert!(!is_hls_url("http://host/movie.mkv?start=0"));
    }

    #[test]
    fn test_cache_rejects_hls() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheMaterializer::new(dir.path().to_path_buf()).unwrap();
        assert!(matches!(
            cache.open("vod-1", "http://host/live/index.m3u8"),
            Err(MaterializeError::NotReady)
        ));
    }

    #[test]
    fn test_cache_serves_existing_file_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheMaterializer::new(dir.path().to_path_buf()).unwrap();

        std::fs::write(dir.path().join("vod-1"), b"cached bytes").unwrap();
        assert_eq!(cache.known_size("vod-1"), Some(12));

        // URL is unreachable; the cached copy must satisfy the open
        let mut reader = cache
            .open("vod-1", "http://192.0.2.1:9/movie.mp4")
            .expect("cached entry should open");
        let mut content = String::new();
        reader.read_to_string(&mut content).unwrap();
        assert_eq!(content, "cached bytes");
    }

    #[test]
    fn test_unknown_size_for_uncached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheMaterializer::new(dir.path().to_path_buf()).unwrap();
        assert!(cache.known_size("vod-404").is_none());
    }
}
