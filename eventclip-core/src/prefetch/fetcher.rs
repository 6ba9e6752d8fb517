//! Video download sources.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{Error, Result};

/// A video in the scroll list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDescriptor {
    pub id: String,
    pub video_url: String,
}

impl VideoDescriptor {
    pub fn new(id: impl Into<String>, video_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            video_url: video_url.into(),
        }
    }
}

/// Downloads a video and returns a local URI for playback.
#[async_trait]
pub trait VideoFetcher: Send + Sync {
    async fn fetch(&self, video: &VideoDescriptor) -> Result<String>;

    /// Free whatever backs `local_uri` after eviction.
    async fn release(&self, _local_uri: &str) {}
}

/// Fetcher that downloads over HTTP into a cache directory.
///
/// Files are named after the video id, so a file left over from an earlier
/// session is reused without touching the network.
pub struct HttpVideoFetcher {
    client: reqwest::Client,
    cache_dir: PathBuf,
}

impl HttpVideoFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(client, cache_dir))
    }

    pub fn with_client(client: reqwest::Client, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Destination path for a video id.
    pub fn local_path(&self, video_id: &str) -> PathBuf {
        let name: String = video_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.cache_dir.join(format!("{name}.mp4"))
    }

    /// Temp file for one download. Unique per call so overlapping downloads
    /// of the same id never share a partial file.
    fn part_path(&self, destination: &Path) -> PathBuf {
        let mut name = destination
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.part", uuid::Uuid::new_v4().simple()));
        destination.with_file_name(name)
    }

    async fn download(&self, url: &str, part: &Path) -> Result<()> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        write_stream(part, response.bytes_stream()).await
    }
}

#[async_trait]
impl VideoFetcher for HttpVideoFetcher {
    async fn fetch(&self, video: &VideoDescriptor) -> Result<String> {
        let path = self.local_path(&video.id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(video_id = %video.id, path = %path.display(), "Reusing downloaded video");
            return Ok(file_uri(&path));
        }

        if video.video_url.trim().is_empty() {
            return Err(Error::fetch(&video.id, "video url is empty"));
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let part = self.part_path(&path);

        if let Err(e) = self.download(&video.video_url, &part).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(Error::fetch(&video.id, e.to_string()));
        }
        tokio::fs::rename(&part, &path).await?;

        debug!(video_id = %video.id, path = %path.display(), "Video downloaded");
        Ok(file_uri(&path))
    }

    async fn release(&self, local_uri: &str) {
        let Some(path) = local_uri.strip_prefix("file://") else {
            return;
        };
        if let Err(e) = tokio::fs::remove_file(path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path, error = %e, "Failed to remove cached video");
        }
    }
}

/// Write a byte stream to `path`, replacing any existing file.
async fn write_stream<S, E>(path: &Path, mut stream: S) -> Result<()>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    Error: From<E>,
{
    let mut file = tokio::fs::File::create(path).await?;
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(())
}

fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fetcher(dir: &TempDir) -> HttpVideoFetcher {
        HttpVideoFetcher::with_client(reqwest::Client::new(), dir.path())
    }

    #[test]
    fn test_local_path_sanitizes_id() {
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher(&dir);
        assert_eq!(
            fetcher.local_path("../evil/id"),
            dir.path().join("___evil_id.mp4")
        );
        assert_eq!(fetcher.local_path("v-1_a"), dir.path().join("v-1_a.mp4"));
    }

    #[test]
    fn test_part_paths_are_unique_per_download() {
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher(&dir);
        let destination = fetcher.local_path("v1");

        let a = fetcher.part_path(&destination);
        let b = fetcher.part_path(&destination);
        assert_ne!(a, b);
        assert_eq!(a.parent(), destination.parent());
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("v1.mp4."));
        assert!(name.ends_with(".part"));
    }

    #[tokio::test]
    async fn test_existing_file_skips_download() {
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher(&dir);
        let path = fetcher.local_path("v1");
        tokio::fs::write(&path, b"cached").await.unwrap();

        // Unroutable URL: any network access would fail the fetch.
        let video = VideoDescriptor::new("v1", "http://127.0.0.1:9/v1.mp4");
        let uri = fetcher.fetch(&video).await.unwrap();
        assert_eq!(uri, file_uri(&path));
    }

    #[tokio::test]
    async fn test_empty_url_fails_without_file() {
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher(&dir);
        let err = fetcher
            .fetch(&VideoDescriptor::new("v2", " "))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_write_stream_concatenates_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.mp4");
        let chunks = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
        ]);

        write_stream(&path, chunks).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_release_removes_file() {
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher(&dir);
        let path = fetcher.local_path("v3");
        tokio::fs::write(&path, b"x").await.unwrap();

        fetcher.release(&file_uri(&path)).await;
        assert!(!path.exists());
        // Second release of a missing file is quiet.
        fetcher.release(&file_uri(&path)).await;
    }
}
