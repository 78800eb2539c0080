//! `kiosk-content` – versioned content delivery for a kiosk.
//!
//! A run fetches the manifest, assembles the next version in `staging/`
//! (reusing unchanged files from `current/`), validates it and swaps it in
//! with two directory renames.
//!
//! # Modules
//!
//! - [`manifest`] – [`Manifest`][manifest::Manifest] model and
//!   [`fetch_manifest`][manifest::fetch_manifest].
//! - [`download`] – [`DownloadEngine`][download::DownloadEngine]: retry,
//!   resume and media throttling over a [`Transport`][download::Transport].
//! - [`staging`] – [`StagingValidator`][staging::StagingValidator]: cache
//!   reuse plus per-kind validation.
//! - [`publisher`] – [`Publisher`][publisher::Publisher]: atomic swap and
//!   backup rotation.
//! - [`sync`] – [`ContentSync`][sync::ContentSync]: the orchestrated run.

pub mod checksum;
pub mod download;
pub mod manifest;
pub mod publisher;
pub mod staging;
pub mod sync;

pub use download::{DownloadEngine, DownloadOptions, DownloadOutcome, HttpTransport, Transport, TransportResponse};
pub use kiosk_core::MANIFEST_FILE;
pub use manifest::{ContentKind, FileEntry, Manifest};
pub use publisher::{Publisher, PublishReport, Renamer};
pub use staging::{StageReport, StagingValidator};
pub use sync::{ContentSync, SyncOutcome, SyncReport, SyncSettings};
