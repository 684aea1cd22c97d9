//! Terminal front end.
//!
//! [`setup`] lets the user edit tag-sets and the blacklist before a session,
//! [`run`] shows one post at a time and forwards the chosen action to the [`Engine`].

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use dialoguer::{Confirm, Editor, Select};
use indicatif::{ProgressBar, ProgressFinish, ProgressStyle};

use crate::api::{Post, PostSource};
use crate::download::{Saver, Variant};
use crate::engine::{Engine, EngineError};
use crate::store::{parse_lines, Store};

const SPINNER_FINISH_MODE: ProgressFinish = ProgressFinish::AndClear;
const SPINNER_TICK_SECS: f32 = 0.1;
const EDITOR_EXTENSION: &str = ".txt";

const EXHAUSTED_NOTICE: &str = "There are no new posts for any of your tag sets.";
const CHECKPOINT_PROMPT: &str = "Create a checkpoint and move on to the next tag set? \
    Next time you get to this tag set, you will continue where you left off.";
const SKIP_TAG_SET_PROMPT: &str = "Skip the rest of the images in the current tag set? \
    Next time you get to this tag set, only new images will be shown.";

const TAG_SETS_HEADER: &str = "# Each line is a tag set that is searched, \"order\" is not supported.\n";
const BLACKLIST_HEADER: &str = "# One tag per line.\n";

/// What the user picked in the setup menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupChoice {
    /// Begin browsing.
    Start,
    /// Leave without browsing.
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    SaveFull,
    SaveSample,
    Skip,
    Checkpoint,
    SkipTagSet,
    Quit,
}

const ACTIONS: [(Action, &str); 6] = [
    (Action::SaveFull, "Save full"),
    (Action::SaveSample, "Save sample"),
    (Action::Skip, "Skip"),
    (Action::Checkpoint, "Create checkpoint"),
    (Action::SkipTagSet, "Skip all (rest of this tag set)"),
    (Action::Quit, "Quit"),
];

const SETUP_ITEMS: [&str; 4] = ["Start", "Edit tag sets", "Edit blacklist", "Quit"];

#[inline]
fn build_spinner(msg: &'static str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner()
        .with_finish(SPINNER_FINISH_MODE)
        .with_style(
            ProgressStyle::with_template("{spinner:.blue} {msg}")
                .unwrap()
                // NOTE: use `ascii` only, because cmd/powershell maybe not support unicode.
                .tick_strings(&[".  ", ".. ", "...", " ..", "  .", "   "]),
        )
        .with_message(msg);
    spinner.enable_steady_tick(Duration::from_secs_f32(SPINNER_TICK_SECS));
    spinner
}

#[inline]
fn build_download_bar() -> ProgressBar {
    const TEMPLATE: &str = "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})";

    ProgressBar::new(0)
        .with_style(
            ProgressStyle::with_template(TEMPLATE)
                .unwrap()
                .progress_chars("#>-"),
        )
        .with_finish(ProgressFinish::AndClear)
}

/// Run a blocking prompt without stalling the runtime.
async fn prompt<T, E, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("prompt task failed")?
        .context("failed to read from the terminal")
}

async fn confirm(text: &'static str) -> anyhow::Result<bool> {
    prompt(move || Confirm::new().with_prompt(text).default(false).interact()).await
}

async fn with_spinner<T>(future: impl Future<Output = T>) -> T {
    let spinner = build_spinner("Looking for the next post...");
    let output = future.await;
    spinner.finish_and_clear();
    output
}

/// Open the editor on `entries`. `None` if the user did not save.
async fn edit_list(header: &'static str, entries: &[String]) -> anyhow::Result<Option<Vec<String>>> {
    let text = format!("{header}{}", entries.join("\n"));
    let edited = prompt(move || Editor::new().extension(EDITOR_EXTENSION).edit(&text)).await?;
    Ok(edited.map(|text| {
        parse_lines(&text)
            .into_iter()
            .filter(|line| !line.starts_with('#'))
            .collect()
    }))
}

/// The menu shown before a session. Every edit is saved right away.
pub async fn setup(store: &Store) -> anyhow::Result<SetupChoice> {
    loop {
        let tag_sets = store.read_tag_sets().await?;
        let blacklist = store.read_blacklist().await?;
        println!(
            "{} tag set(s), {} blacklisted tag(s)",
            tag_sets.len(),
            blacklist.len()
        );

        let choice = prompt(|| {
            Select::new()
                .with_prompt("What do you want to do?")
                .items(&SETUP_ITEMS)
                .default(0)
                .interact()
        })
        .await?;

        match choice {
            0 if tag_sets.is_empty() => println!("Add at least one tag set first."),
            0 => return Ok(SetupChoice::Start),
            1 => {
                if let Some(tag_sets) = edit_list(TAG_SETS_HEADER, &tag_sets).await? {
                    store.save_tag_sets(&tag_sets).await?;
                }
            }
            2 => {
                if let Some(blacklist) = edit_list(BLACKLIST_HEADER, &blacklist).await? {
                    store.save_blacklist(&blacklist).await?;
                }
            }
            _ => return Ok(SetupChoice::Quit),
        }
    }
}

fn show(tag_set: &str, post: &Post) {
    let animated = if post.extension.eq_ignore_ascii_case("gif") {
        " (animated GIF)"
    } else {
        ""
    };
    println!();
    println!("Tags: {tag_set}");
    println!("Artist(s): {}{animated}", post.artists_display());
    println!("Post #{}", post.id);
    if let Some(full_url) = &post.full_url {
        println!("  full:   {full_url}");
    }
    println!("  sample: {}", post.sample_url);
}

/// Save `post`, reporting the outcome. `false` if nothing was saved.
async fn save(saver: &Saver, post: &Post, variant: Variant) -> bool {
    let progress = build_download_bar();
    match saver.save(post, variant, Some(progress.clone())).await {
        Ok(saved) => {
            progress.finish_and_clear();
            println!("Saved {}", saved.path.display());
            if saved.verified == Some(false) {
                println!("Warning: the saved file does not match the MD5 reported by the API.");
            }
            true
        }
        // why `{:#}`: https://docs.rs/anyhow/1.0.86/anyhow/struct.Error.html#display-representations
        Err(err) => {
            progress.abandon();
            let err = anyhow::Error::from(err).context(format!("Failed to save post {}", post.id));
            eprintln!("{:#}", err);
            false
        }
    }
}

/// Show posts until the user quits or every tag-set is exhausted.
pub async fn run<S: PostSource>(engine: &mut Engine<S>, saver: &Saver) -> anyhow::Result<()> {
    let mut result = with_spinner(engine.start()).await;
    loop {
        let post = match result {
            Ok(post) => post,
            Err(EngineError::Exhausted) => {
                println!("{EXHAUSTED_NOTICE}");
                return Ok(());
            }
            Err(err) => return Err(err).context("failed to load the next post"),
        };
        show(engine.current_tag_set(), &post);

        // stay on this post until an action moves on
        result = loop {
            let labels: Vec<&'static str> = ACTIONS.iter().map(|(_, label)| *label).collect();
            let choice = prompt(move || {
                Select::new()
                    .with_prompt("Action")
                    .items(&labels)
                    .default(0)
                    .interact()
            })
            .await?;

            match ACTIONS[choice].0 {
                Action::SaveFull => {
                    if save(saver, &post, Variant::Full).await {
                        break with_spinner(engine.skip()).await;
                    }
                }
                Action::SaveSample => {
                    if save(saver, &post, Variant::Sample).await {
                        break with_spinner(engine.skip()).await;
                    }
                }
                Action::Skip => break with_spinner(engine.skip()).await,
                Action::Checkpoint => {
                    if confirm(CHECKPOINT_PROMPT).await? {
                        break with_spinner(engine.create_checkpoint()).await;
                    }
                }
                Action::SkipTagSet => {
                    if confirm(SKIP_TAG_SET_PROMPT).await? {
                        break with_spinner(engine.skip_tag_set()).await;
                    }
                }
                Action::Quit => return Ok(()),
            }
        };
    }
}
