//! Core of a crowd-sourced internet radio channel.
//!
//! Three cooperating actors:
//! - [`staging::StagingCache`] downloads and caches track audio in the background,
//! - [`rotation::RotationQueue`] produces a fair, artist-declustered play order,
//! - [`scheduler::PlaybackScheduler`] decides what is on air and publishes
//!   transition events through a [`broadcast::Broadcaster`].

pub mod api;
pub mod broadcast;
pub mod catalog;
pub mod config;
pub mod error;
pub mod rotation;
pub mod scheduler;
pub mod staging;
pub mod track;

pub use error::{EngineError, Result};
