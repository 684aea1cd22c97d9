//! A core module that decides which post to show next.
//!
//! See [`Engine`] for more information.
//!
//! The engine walks the tag-sets in order. Inside a tag-set it either pages
//! through the newest results ([`ResumeMode::Fresh`]), or follows a backward
//! cursor from a saved post ([`ResumeMode::LastPost`] and [`ResumeMode::Checkpoint`]).
//! A tag-set ends when the API has no more posts, or when the newest post seen on a
//! previous pass comes up again. When every tag-set ends in a row, the session is over.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{Post, PostSource, Query};
use crate::store::{LastPost, Records, Store, StoreError};

/// Where the engine is inside the current tag-set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResumeMode {
    /// Page through the newest results of the tag-set.
    #[default]
    Fresh,
    /// Continue from the post shown last in the previous session.
    LastPost {
        tag_set: String,
        post_id: u64,
        /// The post itself has not been shown again yet.
        at_anchor: bool,
    },
    /// Continue from a checkpoint of the current tag-set.
    Checkpoint {
        post_id: u64,
        /// The checkpoint post itself has not been shown yet.
        at_anchor: bool,
    },
}

/// Session-local position.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cursor {
    /// Index into the tag-set list.
    pub tag_set_num: usize,
    /// Number of pages consumed in the current tag-set.
    pub image_num: u64,
    pub resume: ResumeMode,
}

/// The result of one [`Engine::advance`] step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// A post to show.
    Shown(Post),
    /// Nothing (new) left in this tag-set.
    ReachedEnd,
    /// The page could not be used, try the next one.
    FetchError,
}

/// How failed fetches are retried inside [`Engine::load_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Pause before the next attempt.
    pub delay: Duration,
    /// Give up after this many failures in a row, `0` means never.
    pub max_consecutive: u32,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("there are no tag sets to search")]
    NoTagSets,
    #[error("there are no new posts for any of your tag sets")]
    Exhausted,
    #[error("fetching from tag set `{tag_set}` failed {count} times in a row")]
    TooManyFetchErrors { tag_set: String, count: u32 },
    #[error("no post is being shown")]
    NoCurrentPost,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/** The traversal engine.

It owns the persisted [`Records`] and writes them back through the [`Store`]
right after every change, so the process can stop at any prompt without losing its place.

# Example
```no_run
use reqwest::Client;
use booru_curator::api::{url, Api};
use booru_curator::engine::{Engine, RetryPolicy};
use booru_curator::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let api = Api::build(Client::new(), url::BASE_URL)?;
    let store = Store::open(".").await?;

    let mut engine = Engine::open(api, store, RetryPolicy::default()).await?;
    let post = engine.start().await?;
    println!("{:?}", post.full_url);

    let post = engine.skip().await?;
    println!("{:?}", post.full_url);
    Ok(())
}
```
*/
pub struct Engine<S> {
    source: S,
    store: Store,
    records: Records,
    cursor: Cursor,
    current: Option<Post>,
    retry: RetryPolicy,
}

impl<S: PostSource> Engine<S> {
    /// Load all records from `store`.
    ///
    /// # Errors
    ///
    /// If a record cannot be read, or there are no tag-sets, an error will be returned.
    pub async fn open(source: S, store: Store, retry: RetryPolicy) -> Result<Self, EngineError> {
        let records = store.load().await?;
        Self::with_records(source, store, records, retry)
    }

    /// Like [`Self::open`], with records that are already loaded.
    pub fn with_records(
        source: S,
        store: Store,
        records: Records,
        retry: RetryPolicy,
    ) -> Result<Self, EngineError> {
        if records.tag_sets.is_empty() {
            return Err(EngineError::NoTagSets);
        }
        Ok(Self {
            source,
            store,
            records,
            cursor: Cursor::default(),
            current: None,
            retry,
        })
    }

    #[inline]
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    #[inline]
    pub fn records(&self) -> &Records {
        &self.records
    }

    /// The post returned by the last successful load.
    #[inline]
    pub fn current_post(&self) -> Option<&Post> {
        self.current.as_ref()
    }

    #[inline]
    pub fn current_tag_set(&self) -> &str {
        &self.records.tag_sets[self.cursor.tag_set_num]
    }

    /// Begin the session, continuing from the last post if its tag-set still exists.
    pub async fn start(&mut self) -> Result<Post, EngineError> {
        if let Some(LastPost { tag_set, post_id }) = self.records.last_post.clone() {
            match self.records.tag_sets.iter().position(|t| *t == tag_set) {
                Some(tag_set_num) => {
                    info!(%tag_set, post_id, "continuing from last post");
                    self.cursor = Cursor {
                        tag_set_num,
                        resume: ResumeMode::LastPost {
                            tag_set,
                            post_id,
                            at_anchor: true,
                        },
                        ..Cursor::default()
                    };
                }
                None => debug!(%tag_set, "last post belongs to a removed tag set"),
            }
        }
        self.load_next(false, true).await
    }

    /// Show the next post of the current tag-set. Also used after saving.
    pub async fn skip(&mut self) -> Result<Post, EngineError> {
        self.load_next(false, false).await
    }

    /// Forget the rest of the current tag-set and move on to the next one.
    pub async fn skip_tag_set(&mut self) -> Result<Post, EngineError> {
        self.clear_last_post().await?;
        self.forget_previous_head().await?;
        self.load_next(true, false).await
    }

    /// Bookmark the current post and move on to the next tag-set.
    ///
    /// The next time the engine reaches this tag-set, it starts at the bookmark.
    pub async fn create_checkpoint(&mut self) -> Result<Post, EngineError> {
        let post_id = self
            .current
            .as_ref()
            .map(|post| post.id)
            .ok_or(EngineError::NoCurrentPost)?;
        let tag_set = self.current_tag_set().to_owned();

        info!(%tag_set, post_id, "creating checkpoint");
        self.records.checkpoints.insert(tag_set, post_id);
        self.store
            .save_checkpoints(&self.records.checkpoints)
            .await?;

        // The forced end below must not consume the checkpoint we just wrote.
        self.cursor.resume = ResumeMode::Fresh;
        self.load_next(true, false).await
    }

    /// Remove the checkpoint of `tag_set`, if there is one.
    pub async fn remove_checkpoint(&mut self, tag_set: &str) -> Result<(), StoreError> {
        if self.records.checkpoints.remove(tag_set).is_some() {
            info!(%tag_set, "checkpoint ended");
        }
        self.store.save_checkpoints(&self.records.checkpoints).await
    }

    /// The pass over the current tag-set is over, its replaced head is no longer needed.
    async fn forget_previous_head(&mut self) -> Result<(), StoreError> {
        let tag_set = &self.records.tag_sets[self.cursor.tag_set_num];
        if self.records.previous_heads.remove(tag_set).is_none() {
            return Ok(());
        }
        self.store
            .save_previous_heads(&self.records.previous_heads)
            .await
    }

    /// Forget the last shown post.
    pub async fn clear_last_post(&mut self) -> Result<(), StoreError> {
        self.records.last_post = None;
        self.store.clear_last_post().await
    }

    /// The lookup for the current cursor.
    pub fn next_query(&self) -> Query {
        match &self.cursor.resume {
            ResumeMode::LastPost {
                post_id,
                at_anchor: true,
                ..
            }
            | ResumeMode::Checkpoint {
                post_id,
                at_anchor: true,
            } => Query::exact(*post_id),
            ResumeMode::LastPost {
                tag_set, post_id, ..
            } => Query::before(tag_set.as_str(), *post_id),
            ResumeMode::Checkpoint { post_id, .. } => {
                Query::before(self.current_tag_set(), *post_id)
            }
            ResumeMode::Fresh => Query::nth(self.current_tag_set(), self.cursor.image_num),
        }
    }

    /// Fetch one post for the current cursor and record the progress.
    pub async fn advance(&mut self) -> Result<Advance, StoreError> {
        let query = self.next_query();
        debug!(tags = %query.tags, page = %query.page, "advance");

        let post = match self.source.fetch(&query, &self.records.blacklist).await {
            Ok(post) => post,
            Err(err) if err.is_empty() => return Ok(Advance::ReachedEnd),
            Err(err) => {
                warn!(tags = %query.tags, page = %query.page, "failed to fetch post: {:#}", err);
                return Ok(Advance::FetchError);
            }
        };

        if let Some(full_url) = &post.full_url {
            // the head replaced by this pass marks where the pass before it started
            let previous_head = self.records.previous_heads.get(self.current_tag_set());
            if self.records.latest_posts.get(&query.tags) == Some(full_url)
                || previous_head == Some(full_url)
            {
                debug!(tags = %query.tags, "reached the newest post of the previous pass");
                return Ok(Advance::ReachedEnd);
            }
            if self.cursor.resume == ResumeMode::Fresh && self.cursor.image_num == 0 {
                let replaced = self
                    .records
                    .latest_posts
                    .insert(query.tags.clone(), full_url.clone());
                self.store
                    .save_latest_posts(&self.records.latest_posts)
                    .await?;
                if let Some(replaced) = replaced {
                    let tag_set = self.current_tag_set().to_owned();
                    self.records.previous_heads.insert(tag_set, replaced);
                    self.store
                        .save_previous_heads(&self.records.previous_heads)
                        .await?;
                }
            }
        }

        let replaying_last_post = matches!(
            self.cursor.resume,
            ResumeMode::LastPost {
                at_anchor: true,
                ..
            }
        );
        if !replaying_last_post {
            let last_post = LastPost {
                tag_set: self.current_tag_set().to_owned(),
                post_id: post.id,
            };
            self.store.save_last_post(&last_post).await?;
            self.records.last_post = Some(last_post);
        }

        match &mut self.cursor.resume {
            ResumeMode::Fresh => {}
            ResumeMode::LastPost {
                post_id, at_anchor, ..
            }
            | ResumeMode::Checkpoint { post_id, at_anchor } => {
                *post_id = post.id;
                *at_anchor = false;
            }
        }

        if post.full_url.is_none() {
            debug!(post_id = post.id, "post has no file url");
            return Ok(Advance::FetchError);
        }
        Ok(Advance::Shown(post))
    }

    /// Keep advancing until there is a post to show, moving through tag-sets as they end.
    ///
    /// - `force_new_tag_set`: treat the current tag-set as ended right away.
    /// - `just_started`: the first call of a session. Unless it continues from the last post,
    ///     it starts at the current tag-set instead of rotating away from it.
    ///
    /// # Errors
    ///
    /// [`EngineError::Exhausted`] when every tag-set ended without a post to show.
    pub async fn load_next(
        &mut self,
        force_new_tag_set: bool,
        just_started: bool,
    ) -> Result<Post, EngineError> {
        let continuing = matches!(self.cursor.resume, ResumeMode::LastPost { .. });
        let mut synthetic_end = force_new_tag_set || (just_started && !continuing);
        let mut result = if synthetic_end {
            Advance::ReachedEnd
        } else {
            self.advance().await?
        };

        let start_tag_set_num = self.cursor.tag_set_num;
        let mut rotate = !just_started;
        let mut consecutive_errors = 0;
        loop {
            match result {
                Advance::Shown(post) => {
                    self.cursor.image_num += 1;
                    self.current = Some(post.clone());
                    return Ok(post);
                }
                Advance::ReachedEnd => {
                    consecutive_errors = 0;
                    // a forced end leaves the pass open, e.g. for a checkpoint
                    if !synthetic_end {
                        self.forget_previous_head().await?;
                    }
                    synthetic_end = false;
                    self.end_tag_set(start_tag_set_num, rotate).await?;
                    rotate = true;
                }
                Advance::FetchError => {
                    consecutive_errors += 1;
                    if self.retry.max_consecutive > 0
                        && consecutive_errors >= self.retry.max_consecutive
                    {
                        return Err(EngineError::TooManyFetchErrors {
                            tag_set: self.current_tag_set().to_owned(),
                            count: consecutive_errors,
                        });
                    }
                    self.cursor.image_num += 1;
                    if !self.retry.delay.is_zero() {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
            }
            result = self.advance().await?;
        }
    }

    /// Leave the current tag-set, and set the cursor up for the next one.
    async fn end_tag_set(&mut self, start_tag_set_num: usize, rotate: bool) -> Result<(), EngineError> {
        if matches!(self.cursor.resume, ResumeMode::Checkpoint { .. }) {
            let tag_set = self.current_tag_set().to_owned();
            self.remove_checkpoint(&tag_set).await?;
        }
        self.cursor.resume = ResumeMode::Fresh;

        if rotate {
            self.cursor.tag_set_num = (self.cursor.tag_set_num + 1) % self.records.tag_sets.len();
            if self.cursor.tag_set_num == start_tag_set_num {
                info!("every tag set is exhausted");
                return Err(EngineError::Exhausted);
            }
        }
        self.cursor.image_num = 0;

        let tag_set = self.current_tag_set();
        info!(%tag_set, "moving to tag set");
        if let Some(&post_id) = self.records.checkpoints.get(tag_set) {
            debug!(%tag_set, post_id, "continuing from checkpoint");
            self.cursor.resume = ResumeMode::Checkpoint {
                post_id,
                at_anchor: true,
            };
        }
        Ok(())
    }
}
