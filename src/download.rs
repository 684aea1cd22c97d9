//! Save the shown post into the output folder.
//!
//! Saved files are numbered: the first one is `1.{ext}`, then `2.{ext}` and so on,
//! continuing after the largest number already in the folder.

use std::ffi::OsString;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use reqwest::{Client, IntoUrl, Response, Url};
use thiserror::Error;
use tokio::fs::{self, create_dir_all, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::api::Post;
use crate::hash::md5_matches;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("There is no content to download")]
    ZeroContentLength,
    #[error("Post {0} has no file url")]
    NoUrl(u64),
}

/// Which file of a post to save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Full,
    Sample,
}

/// A finished save.
#[derive(Debug)]
pub struct Saved {
    pub path: PathBuf,
    /// `Some(false)` if the file does not match the MD5 the API reported,
    /// `None` if there was nothing to check against.
    pub verified: Option<bool>,
}

/// `a/1.png` -> `a/1.png.part`
fn part_path(path: &Path) -> PathBuf {
    let mut part: OsString = path.as_os_str().to_owned();
    part.push(".part");
    part.into()
}

pub struct DownloadFutureBuilder<U, P>
where
    U: IntoUrl,
    P: AsRef<Path>,
{
    client: Client,
    url: U,
    file_path: P,
    progress: Option<ProgressBar>,
}

impl<U, P> DownloadFutureBuilder<U, P>
where
    U: IntoUrl,
    P: AsRef<Path>,
{
    fn new(client: Client, url: U, file_path: P) -> Self {
        Self {
            client,
            url,
            file_path,
            progress: None,
        }
    }

    /// Report downloaded bytes to `progress`. Its length is set from the response.
    pub fn add_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The body goes to `{file_path}.part` first, and is renamed once it is complete.
    pub fn build(self) -> impl Future<Output = Result<P, DownloadError>> {
        let Self {
            client,
            url,
            file_path,
            progress,
        } = self;

        async move {
            let mut response = client.get(url).send().await?.error_for_status()?;
            if response.content_length() == Some(0) {
                return Err(DownloadError::ZeroContentLength);
            }
            if let (Some(progress), Some(content_length)) = (&progress, response.content_length()) {
                progress.set_length(content_length);
            }

            let part = part_path(file_path.as_ref());
            let written = match write_part(&mut response, &part, progress.as_ref()).await {
                Ok(written) => written,
                Err(err) => {
                    remove_part(&part).await;
                    return Err(err);
                }
            };
            if written == 0 {
                remove_part(&part).await;
                return Err(DownloadError::ZeroContentLength);
            }
            fs::rename(&part, file_path.as_ref()).await?;
            Ok::<P, DownloadError>(file_path)
        }
    }
}

/// Stream the body of `response` into `part`, returning the number of bytes written.
async fn write_part(
    response: &mut Response,
    part: &Path,
    progress: Option<&ProgressBar>,
) -> Result<u64, DownloadError> {
    let mut file_buf = BufWriter::new(File::create(part).await?);
    let mut written: u64 = 0;
    while let Some(mut chunk) = response.chunk().await? {
        let chunk_len = chunk.len() as u64;
        file_buf.write_all_buf(&mut chunk).await?;
        written += chunk_len;
        if let Some(progress) = progress {
            progress.inc(chunk_len);
        }
    }
    file_buf.flush().await?;
    Ok(written)
}

/// Best effort, the download already failed.
async fn remove_part(part: &Path) {
    match fs::remove_file(part).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %part.display(), "failed to remove partial download: {}", err),
    }
}

/// Saves posts into one folder.
pub struct Saver {
    client: Client,
    download_dir: PathBuf,
}

impl Saver {
    pub fn session(client: Client, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            download_dir: download_dir.into(),
        }
    }

    /// Create the download folder if needed.
    #[inline]
    pub async fn ensure(self) -> std::io::Result<Self> {
        create_dir_all(&self.download_dir).await?;
        Ok(self)
    }

    #[inline]
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    #[inline]
    pub fn future<U>(&self, url: U, filename: impl AsRef<Path>) -> DownloadFutureBuilder<U, PathBuf>
    where
        U: IntoUrl,
    {
        DownloadFutureBuilder::new(self.client.clone(), url, self.download_dir.join(filename))
    }

    /// One more than the largest numbered file in the folder, `1` if there is none.
    ///
    /// Only files named `{number}.{ext}` count.
    pub async fn next_number(&self) -> std::io::Result<u64> {
        let mut largest: Option<u64> = None;
        let mut entries = match fs::read_dir(&self.download_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(1),
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().is_none() {
                continue;
            }
            let number = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok());
            if let Some(number) = number {
                largest = Some(largest.map_or(number, |largest| largest.max(number)));
            }
        }
        Ok(largest.map_or(1, |largest| largest + 1))
    }

    /// Download `variant` of `post` as the next numbered file.
    ///
    /// # Errors
    ///
    /// If the post has no url for `variant`, or the download fails, an error will be returned.
    pub async fn save(
        &self,
        post: &Post,
        variant: Variant,
        progress: Option<ProgressBar>,
    ) -> Result<Saved, DownloadError> {
        let url = match variant {
            Variant::Full => post.full_url.as_deref(),
            Variant::Sample => Some(post.sample_url.as_str()).filter(|url| !url.is_empty()),
        }
        .ok_or(DownloadError::NoUrl(post.id))?;

        let extension = url_extension(url).unwrap_or_else(|| post.extension.clone());
        let filename = format!("{}.{}", self.next_number().await?, extension);
        debug!(post_id = post.id, %url, %filename, "saving post");

        let mut future = self.future(url, &filename);
        if let Some(progress) = progress {
            future = future.add_progress(progress);
        }
        let path = future.build().await?;

        let verified = match (variant, &post.md5) {
            (Variant::Full, Some(md5)) => {
                let matches = md5_matches(&path, md5).await?;
                if !matches {
                    warn!(post_id = post.id, path = %path.display(), "saved file does not match its MD5");
                }
                Some(matches)
            }
            _ => None,
        };
        Ok(Saved { path, verified })
    }
}

/// The extension of the last path segment of `url`, e.g. `jpg` for a sample.
fn url_extension(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let extension = Path::new(url.path()).extension()?.to_str()?;
    Some(extension.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    const URL: &str = "https://httpbin.org/image/png";

    async fn temp_saver() -> (Saver, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let saver = Saver::session(Client::new(), temp_dir.path().join("saved"))
            .ensure()
            .await
            .unwrap();
        (saver, temp_dir)
    }

    #[tokio::test]
    async fn test_next_number() {
        let (saver, _temp_dir) = temp_saver().await;
        assert_eq!(saver.next_number().await.unwrap(), 1);

        let dir = saver.download_dir();
        for name in ["1.png", "7.jpg", "cat.png", "12", "3.gif.part", "notes.txt"] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.join("40.d")).unwrap();

        assert_eq!(saver.next_number().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_next_number_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let saver = Saver::session(Client::new(), temp_dir.path().join("nope"));
        assert_eq!(saver.next_number().await.unwrap(), 1);
    }

    #[test]
    fn test_url_extension() {
        assert_eq!(
            url_extension("https://static1.e621.net/data/sample/ab/cd/abcd.jpg").as_deref(),
            Some("jpg")
        );
        assert_eq!(url_extension("https://example.com/no_extension"), None);
        assert_eq!(url_extension("not a url"), None);
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/tmp/1.png")),
            PathBuf::from("/tmp/1.png.part")
        );
    }

    #[tokio::test]
    async fn test_save_without_url() {
        let (saver, _temp_dir) = temp_saver().await;
        let post = Post {
            id: 3,
            full_url: None,
            sample_url: String::new(),
            extension: String::from("png"),
            md5: None,
            artists: Vec::new(),
        };

        let err = saver.save(&post, Variant::Full, None).await.unwrap_err();
        assert!(matches!(err, DownloadError::NoUrl(3)));
        let err = saver.save(&post, Variant::Sample, None).await.unwrap_err();
        assert!(matches!(err, DownloadError::NoUrl(3)));
    }

    /// Serve one response that promises more bytes than it sends.
    async fn serve_truncated_body() -> String {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n0123456789")
                .await;
            let _ = stream.flush().await;
        });
        format!("http://{addr}/1.png")
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_part_file() {
        let temp_dir = TempDir::new().unwrap();
        let client = Client::builder().no_proxy().build().unwrap();
        let saver = Saver::session(client, temp_dir.path()).ensure().await.unwrap();
        let url = serve_truncated_body().await;

        let result = saver.future(url, "1.png").build().await;
        assert!(result.is_err());
        assert!(!temp_dir.path().join("1.png").exists());
        assert!(!temp_dir.path().join("1.png.part").exists());
        assert_eq!(saver.next_number().await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn test_download() {
        let (saver, _temp_dir) = temp_saver().await;

        let progress = ProgressBar::hidden();
        let path = saver
            .future(URL, "1.png")
            .add_progress(progress.clone())
            .build()
            .await
            .expect("Download failed");
        assert!(path.is_file());
        assert!(!part_path(&path).exists());
        assert_ne!(progress.position(), 0);
        assert_eq!(saver.next_number().await.unwrap(), 2);
    }
}
