//! Flat-file persistence for tag-sets, the blacklist and traversal progress.
//!
//! Every record lives in its own file under one data directory.
//! Reads fall back to an empty value when the file is missing,
//! writes always replace the whole file.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// A list of tag-sets, one search per line.
pub const TAGS_FILENAME: &str = "tags.txt";

/// A list of blacklisted tags, one tag per line.
pub const BLACKLIST_FILENAME: &str = "blacklist.txt";

/// The newest post seen for each query. Reaching it again means nothing is new.
pub const LATEST_POSTS_FILENAME: &str = "latest_posts.json";

/// The tag-set and post that was shown last. The next session continues from here.
pub const LAST_POST_FILENAME: &str = "last_post.json";

/// Manual bookmarks inside tag-sets.
pub const CHECKPOINTS_FILENAME: &str = "checkpoints.json";

/// The head a tag-set had before its current pass replaced it.
/// Kept until that pass reaches it, across sessions.
pub const PREVIOUS_HEADS_FILENAME: &str = "previous_heads.json";

/// Query tag term -> full URL of the newest post seen for it.
pub type LatestPosts = BTreeMap<String, String>;

/// Tag-set -> post id to continue from.
pub type Checkpoints = BTreeMap<String, u64>;

/// The most recently shown post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastPost {
    pub tag_set: String,
    pub post_id: u64,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in {}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything the engine reads at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Records {
    pub tag_sets: Vec<String>,
    pub blacklist: Vec<String>,
    pub latest_posts: LatestPosts,
    pub last_post: Option<LastPost>,
    pub checkpoints: Checkpoints,
    /// Tag-set -> full URL of the head replaced by the pass in progress.
    pub previous_heads: LatestPosts,
}

#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Use `dir` as the data directory, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
        Ok(Self { dir })
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[inline]
    fn path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// `None` if the file does not exist.
    async fn read_optional(&self, filename: &str) -> Result<Option<String>, StoreError> {
        let path = self.path(filename);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no such file, using default");
                Ok(None)
            }
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn write(&self, filename: &str, content: impl AsRef<[u8]>) -> Result<(), StoreError> {
        let path = self.path(filename);
        fs::write(&path, content)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }

    async fn read_lines(&self, filename: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .read_optional(filename)
            .await?
            .map(|content| parse_lines(&content))
            .unwrap_or_default())
    }

    async fn write_lines(&self, filename: &str, lines: &[String]) -> Result<(), StoreError> {
        self.write(filename, lines.join("\n")).await
    }

    async fn read_json<T: DeserializeOwned + Default>(
        &self,
        filename: &str,
    ) -> Result<T, StoreError> {
        match self.read_optional(filename).await? {
            Some(content) => serde_json::from_str(&content).map_err(|source| StoreError::Json {
                path: self.path(filename),
                source,
            }),
            None => Ok(T::default()),
        }
    }

    async fn write_json<T: Serialize>(&self, filename: &str, value: &T) -> Result<(), StoreError> {
        let content = serde_json::to_string(value).map_err(|source| StoreError::Json {
            path: self.path(filename),
            source,
        })?;
        self.write(filename, content).await
    }

    pub async fn read_tag_sets(&self) -> Result<Vec<String>, StoreError> {
        self.read_lines(TAGS_FILENAME).await
    }

    pub async fn save_tag_sets(&self, tag_sets: &[String]) -> Result<(), StoreError> {
        self.write_lines(TAGS_FILENAME, tag_sets).await
    }

    pub async fn read_blacklist(&self) -> Result<Vec<String>, StoreError> {
        self.read_lines(BLACKLIST_FILENAME).await
    }

    pub async fn save_blacklist(&self, blacklist: &[String]) -> Result<(), StoreError> {
        self.write_lines(BLACKLIST_FILENAME, blacklist).await
    }

    /// Entries without a URL (`null`) are dropped, there is no head to compare against.
    pub async fn read_latest_posts(&self) -> Result<LatestPosts, StoreError> {
        let latest_posts: BTreeMap<String, Option<String>> =
            self.read_json(LATEST_POSTS_FILENAME).await?;
        Ok(latest_posts
            .into_iter()
            .filter_map(|(tags, full_url)| {
                if full_url.is_none() {
                    debug!(%tags, "latest post without url, ignored");
                }
                Some((tags, full_url?))
            })
            .collect())
    }

    pub async fn save_latest_posts(&self, latest_posts: &LatestPosts) -> Result<(), StoreError> {
        self.write_json(LATEST_POSTS_FILENAME, latest_posts).await
    }

    /// An empty JSON object counts as "no last post".
    pub async fn read_last_post(&self) -> Result<Option<LastPost>, StoreError> {
        let value: serde_json::Value = self.read_json(LAST_POST_FILENAME).await?;
        match value {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::Object(ref map) if map.is_empty() => Ok(None),
            value => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StoreError::Json {
                    path: self.path(LAST_POST_FILENAME),
                    source,
                }),
        }
    }

    pub async fn save_last_post(&self, last_post: &LastPost) -> Result<(), StoreError> {
        self.write_json(LAST_POST_FILENAME, last_post).await
    }

    /// Delete the last post record. A missing file is fine.
    pub async fn clear_last_post(&self) -> Result<(), StoreError> {
        let path = self.path(LAST_POST_FILENAME);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    pub async fn read_checkpoints(&self) -> Result<Checkpoints, StoreError> {
        self.read_json(CHECKPOINTS_FILENAME).await
    }

    pub async fn save_checkpoints(&self, checkpoints: &Checkpoints) -> Result<(), StoreError> {
        self.write_json(CHECKPOINTS_FILENAME, checkpoints).await
    }

    pub async fn read_previous_heads(&self) -> Result<LatestPosts, StoreError> {
        self.read_json(PREVIOUS_HEADS_FILENAME).await
    }

    pub async fn save_previous_heads(&self, previous_heads: &LatestPosts) -> Result<(), StoreError> {
        self.write_json(PREVIOUS_HEADS_FILENAME, previous_heads).await
    }

    /// Read every record.
    pub async fn load(&self) -> Result<Records, StoreError> {
        Ok(Records {
            tag_sets: self.read_tag_sets().await?,
            blacklist: self.read_blacklist().await?,
            latest_posts: self.read_latest_posts().await?,
            last_post: self.read_last_post().await?,
            checkpoints: self.read_checkpoints().await?,
            previous_heads: self.read_previous_heads().await?,
        })
    }
}

/// Split user text into entries, one per line. Blank lines are dropped.
pub fn parse_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    async fn temp_store() -> (Store, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(temp_dir.path()).await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_missing_files_are_empty() {
        let (store, _temp_dir) = temp_store().await;

        let records = store.load().await.unwrap();
        assert_eq!(records, Records::default());
    }

    #[tokio::test]
    async fn test_open_creates_dir() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b");

        let store = Store::open(&nested).await.unwrap();
        assert!(store.dir().is_dir());
    }

    #[tokio::test]
    async fn test_lines_roundtrip_skip_blank() {
        let (store, temp_dir) = temp_store().await;

        std::fs::write(
            temp_dir.path().join(TAGS_FILENAME),
            "fox\n\nwolf rating:s  \n   \n",
        )
        .unwrap();
        let tag_sets = store.read_tag_sets().await.unwrap();
        assert_eq!(tag_sets, ["fox", "wolf rating:s"]);

        store
            .save_blacklist(&[String::from("gore"), String::from("scat")])
            .await
            .unwrap();
        let content = std::fs::read_to_string(temp_dir.path().join(BLACKLIST_FILENAME)).unwrap();
        assert_eq!(content, "gore\nscat");
    }

    #[tokio::test]
    async fn test_last_post() {
        let (store, temp_dir) = temp_store().await;
        let path = temp_dir.path().join(LAST_POST_FILENAME);

        std::fs::write(&path, "{}").unwrap();
        assert_eq!(store.read_last_post().await.unwrap(), None);

        let last_post = LastPost {
            tag_set: String::from("fox"),
            post_id: 42,
        };
        store.save_last_post(&last_post).await.unwrap();
        assert_eq!(store.read_last_post().await.unwrap(), Some(last_post));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            r#"{"tag_set":"fox","post_id":42}"#
        );

        store.clear_last_post().await.unwrap();
        assert!(!path.exists());
        // clearing twice is fine
        store.clear_last_post().await.unwrap();
        assert_eq!(store.read_last_post().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_checkpoints_and_latest_posts() {
        let (store, _temp_dir) = temp_store().await;

        let mut checkpoints = Checkpoints::new();
        checkpoints.insert(String::from("fox"), 100);
        store.save_checkpoints(&checkpoints).await.unwrap();
        assert_eq!(store.read_checkpoints().await.unwrap(), checkpoints);

        let mut latest_posts = LatestPosts::new();
        latest_posts.insert(String::from("fox"), String::from("https://x/1.png"));
        store.save_latest_posts(&latest_posts).await.unwrap();
        assert_eq!(store.read_latest_posts().await.unwrap(), latest_posts);
    }

    #[tokio::test]
    async fn test_latest_posts_without_url() {
        let (store, temp_dir) = temp_store().await;
        std::fs::write(
            temp_dir.path().join(LATEST_POSTS_FILENAME),
            r#"{"fox": null, "wolf": "https://x/2.png"}"#,
        )
        .unwrap();

        let latest_posts = store.read_latest_posts().await.unwrap();
        assert_eq!(latest_posts.len(), 1);
        assert_eq!(latest_posts["wolf"], "https://x/2.png");
        assert!(store.load().await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let (store, temp_dir) = temp_store().await;
        std::fs::write(temp_dir.path().join(CHECKPOINTS_FILENAME), "not json").unwrap();

        let err = store.read_checkpoints().await.unwrap_err();
        assert!(matches!(err, StoreError::Json { .. }));
    }
}
