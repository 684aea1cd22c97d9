#![warn(missing_docs)]

//! <div class="warning">
//!
//! Note: API is unstable, and may change in `0.x` versions.
//!
//! </div>
//!
//! Curate saved e621 searches one post at a time.
//!
//! # As a library
//!
//! The heart of the crate is [`engine::Engine`]: given the tag-sets, the blacklist
//! and the progress saved by [`store::Store`], it decides which post to show next
//! and remembers where to continue in the next session.
//! Posts are looked up through [`api::PostSource`], see [`api::Api`] for the real one.
//!
//! See [`engine::Engine#example`] for example.
//!
//! # As a binary
//!
//! In addition to the above, you also need [`cli`] and [`ui`] (feature `cli`)
//! to build the command line.
//!
//! See `main.rs` to know how to assemble these modules as a binary.

pub mod api;
#[cfg(feature = "cli")]
pub mod cli;
pub mod engine;
pub mod store;
#[cfg(feature = "cli")]
pub mod ui;

pub mod config;
pub mod download;
pub mod hash;
