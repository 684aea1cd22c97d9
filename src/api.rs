//! A core module for interacting with the e621 posts API.
//!
//! The [`crate::engine`] never talks to [`reqwest`] directly, it asks a [`PostSource`]
//! for exactly one post per step. [`Api`] is the [`PostSource`] backed by the real API.

use std::fmt;
use std::future::Future;

use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// The URLs of the e621 API.
pub mod url {
    /// The base URL of e621.
    pub const BASE_URL: &str = "https://e621.net";

    /// The post search endpoint, relative to the base URL.
    ///
    /// See: <https://e621.net/help/api#posts_list>
    pub const POSTS_PATH: &str = "posts.json";
}

/// Search terms appended to every query: newest first, no flash and no webm.
pub const FIXED_FILTERS: [&str; 3] = ["order:id_desc", "-type:swf", "-type:webm"];

/// This struct mirrors the raw JSON shape, and is flattened into [`data::field::Post`].
#[derive(Deserialize)]
pub(crate) struct PostInner {
    pub(crate) id: u64,
    pub(crate) file: FileInner,
    #[serde(default)]
    pub(crate) sample: SampleInner,
    #[serde(default)]
    pub(crate) tags: TagsInner,
}

#[derive(Deserialize)]
pub(crate) struct FileInner {
    pub(crate) url: Option<String>,
    pub(crate) ext: String,
    #[serde(default)]
    pub(crate) md5: Option<String>,
}

#[derive(Deserialize, Default)]
pub(crate) struct SampleInner {
    pub(crate) url: Option<String>,
}

#[derive(Deserialize, Default)]
pub(crate) struct TagsInner {
    #[serde(default)]
    pub(crate) artist: Vec<String>,
}

impl From<PostInner> for data::field::Post {
    /// e621 leaves `sample.url` empty for posts that are small enough,
    /// in that case the full image doubles as the sample.
    fn from(value: PostInner) -> Self {
        let PostInner {
            id,
            file,
            sample,
            tags,
        } = value;

        let sample_url = sample
            .url
            .or_else(|| file.url.clone())
            .unwrap_or_default();

        Self {
            id,
            full_url: file.url,
            sample_url,
            extension: file.ext,
            md5: file.md5,
            artists: tags.artist,
        }
    }
}

/// The data structure for the JSON response from the e621 API.
pub mod data {
    use super::*;

    /// The fields of the [`Json`] response.
    pub mod field {
        use super::*;

        /// A single post of the JSON response.
        #[non_exhaustive]
        #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
        #[serde(from = "PostInner")]
        pub struct Post {
            /// The ID of the post.
            pub id: u64,
            /// The URL of the original file.
            /// `None` when the post is hidden from anonymous users.
            pub full_url: Option<String>,
            /// The URL of the downscaled sample.
            pub sample_url: String,
            /// The file extension, without the dot.
            pub extension: String,
            /// The MD5 hash of the original file, if the API sent one.
            pub md5: Option<String>,
            /// The artist tags, in API order.
            pub artists: Vec<String>,
        }

        impl Post {
            /// Artists joined for display, e.g. `"foo, bar"`.
            pub fn artists_display(&self) -> String {
                self.artists.join(", ")
            }
        }
    }

    /// The JSON structure response from `/posts.json`.
    #[non_exhaustive]
    #[derive(Debug, Deserialize)]
    pub struct Json {
        /// The posts of the response, empty when nothing matched.
        pub posts: Vec<field::Post>,
    }
}

pub use data::field::Post;

/// The `page` parameter of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    /// An ordinal page, starting at `1`.
    Number(u64),
    /// Every post with an id lower than this one, i.e. `b{id}`.
    Before(u64),
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Page::Number(page) => write!(f, "{page}"),
            Page::Before(id) => write!(f, "b{id}"),
        }
    }
}

/// One post lookup: the tag term and where to start in its results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// The tag term, without the fixed filters and the blacklist.
    pub tags: String,
    /// Where to start in the results.
    pub page: Page,
}

impl Query {
    /// Look up exactly one post by id.
    pub fn exact(post_id: u64) -> Self {
        Self {
            tags: format!("id:{post_id}"),
            page: Page::Number(1),
        }
    }

    /// The `image_num`-th post of `tags`, counting from zero.
    pub fn nth(tags: impl Into<String>, image_num: u64) -> Self {
        Self {
            tags: tags.into(),
            page: Page::Number(image_num + 1),
        }
    }

    /// The newest post of `tags` older than `post_id`.
    pub fn before(tags: impl Into<String>, post_id: u64) -> Self {
        Self {
            tags: tags.into(),
            page: Page::Before(post_id),
        }
    }
}

/// Build the full `tags` parameter sent to the API.
///
/// e.g. `("fox", ["gore"])` -> `"fox order:id_desc -type:swf -type:webm -gore"`.
pub fn search_tags(tags: &str, blacklist: &[String]) -> String {
    let mut search = String::from(tags.trim());
    for filter in FIXED_FILTERS {
        search.push(' ');
        search.push_str(filter);
    }
    for tag in blacklist {
        search.push_str(" -");
        search.push_str(tag);
    }
    search
}

/// Why a lookup did not produce a post.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum FetchOutcome {
    /// The search has no (more) results.
    #[error("no posts returned")]
    Empty,
    /// The API answered, but not with a success status.
    #[error("API answered with status {0}")]
    Status(StatusCode),
    /// The request itself failed, or the body was not the expected JSON.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl FetchOutcome {
    /// `true` if the search simply has no (more) results.
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Something that can look up a single post.
pub trait PostSource {
    /// Return the first post of `query`, with `blacklist` excluded.
    fn fetch(
        &self,
        query: &Query,
        blacklist: &[String],
    ) -> impl Future<Output = Result<Post, FetchOutcome>>;
}

/// [`PostSource`] backed by the e621 API.
///
/// # Example
///
/// ```no_run
/// use reqwest::Client;
/// use booru_curator::api::{Api, PostSource, Query};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let api = Api::build(Client::new(), booru_curator::api::url::BASE_URL)?;
///     let post = api.fetch(&Query::nth("fox", 0), &[]).await?;
///     println!("{:?}", post.full_url);
///     Ok(())
/// }
/// ```
pub struct Api {
    client: Client,
    posts_url: Url,
}

impl Api {
    /// # Errors
    ///
    /// If `base_url` is not a valid URL, this function will return an error.
    pub fn build(client: Client, base_url: &str) -> anyhow::Result<Self> {
        let posts_url = Url::parse(base_url)?.join(url::POSTS_PATH)?;
        Ok(Self { client, posts_url })
    }

    /// The search endpoint this source queries.
    pub fn posts_url(&self) -> &Url {
        &self.posts_url
    }
}

impl PostSource for Api {
    async fn fetch(&self, query: &Query, blacklist: &[String]) -> Result<Post, FetchOutcome> {
        let tags = search_tags(&query.tags, blacklist);
        let page = query.page.to_string();

        let mut target_url = self.posts_url.clone();
        target_url.query_pairs_mut().extend_pairs([
            ("limit", "1"),
            ("tags", tags.as_str()),
            ("page", page.as_str()),
        ]);
        debug!(%target_url, "fetching post");

        let response = self.client.get(target_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchOutcome::Status(status));
        }

        let json: data::Json = response.json().await?;
        json.posts.into_iter().next().ok_or(FetchOutcome::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"{
        "posts": [
            {
                "id": 4321,
                "file": {"width": 10, "height": 10, "ext": "png", "size": 1,
                         "md5": "9e107d9d372bb6826bd81d3542a419d6",
                         "url": "https://static1.e621.net/data/9e/10/full.png"},
                "sample": {"has": true, "url": "https://static1.e621.net/data/sample/9e/10/s.jpg"},
                "tags": {"general": ["fox"], "artist": ["alice", "bob"]}
            }
        ]
    }"#;

    #[test]
    fn test_search_tags() {
        let blacklist = vec![String::from("gore")];
        assert_eq!(
            search_tags("fox", &blacklist),
            "fox order:id_desc -type:swf -type:webm -gore"
        );
        assert_eq!(
            search_tags("fox wolf", &[]),
            "fox wolf order:id_desc -type:swf -type:webm"
        );
    }

    #[test]
    fn test_page_display() {
        assert_eq!(Page::Number(3).to_string(), "3");
        assert_eq!(Page::Before(1234).to_string(), "b1234");
        assert_eq!(Query::exact(7).tags, "id:7");
        assert_eq!(Query::exact(7).page, Page::Number(1));
        assert_eq!(Query::nth("fox", 0).page, Page::Number(1));
    }

    #[test]
    fn test_parse_posts() {
        let json: data::Json = serde_json::from_str(RESPONSE).unwrap();
        let post = &json.posts[0];
        assert_eq!(post.id, 4321);
        assert_eq!(post.extension, "png");
        assert_eq!(post.artists_display(), "alice, bob");
        assert_eq!(
            post.full_url.as_deref(),
            Some("https://static1.e621.net/data/9e/10/full.png")
        );
        assert_eq!(
            post.sample_url,
            "https://static1.e621.net/data/sample/9e/10/s.jpg"
        );
    }

    #[test]
    fn test_parse_hidden_post() {
        let json: data::Json = serde_json::from_str(
            r#"{"posts": [{"id": 1, "file": {"ext": "jpg", "url": null, "md5": null},
                "sample": {"url": null}, "tags": {"artist": []}}]}"#,
        )
        .unwrap();
        let post = &json.posts[0];
        assert_eq!(post.full_url, None);
        assert_eq!(post.sample_url, "");
        assert!(post.artists.is_empty());
    }

    #[test]
    fn test_sample_falls_back_to_full() {
        let json: data::Json = serde_json::from_str(
            r#"{"posts": [{"id": 2, "file": {"ext": "gif", "url": "https://x/full.gif"},
                "sample": {"has": false, "url": null}, "tags": {"artist": ["carol"]}}]}"#,
        )
        .unwrap();
        assert_eq!(json.posts[0].sample_url, "https://x/full.gif");
    }

    #[test]
    fn test_parse_empty() {
        let json: data::Json = serde_json::from_str(r#"{"posts": []}"#).unwrap();
        assert!(json.posts.is_empty());
    }

    #[test]
    fn test_posts_url() {
        let api = Api::build(Client::new(), url::BASE_URL).unwrap();
        assert_eq!(api.posts_url().as_str(), "https://e621.net/posts.json");
        assert!(Api::build(Client::new(), "not a url").is_err());
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn test_fetch_live() {
        let client = Client::builder()
            .user_agent("booru-curator tests")
            .build()
            .unwrap();
        let api = Api::build(client, url::BASE_URL).unwrap();

        let post = api.fetch(&Query::nth("fox", 0), &[]).await.unwrap();
        assert!(post.id > 0);

        let resp = api
            .fetch(&Query::nth("balabala_just_no_exist", 0), &[])
            .await;
        assert!(matches!(resp, Err(FetchOutcome::Empty)));
    }
}
