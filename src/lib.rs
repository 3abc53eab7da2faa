//! Voice-note viewer core.
//!
//! Resolves chat media stored in a PocketBase record store, decodes voice
//! notes and plays them with progress tracking, and falls back to a
//! download-only view on mobile platforms where inline playback fails.
//! The binary drives it over JSON-line IPC on stdin/stdout.

pub mod app;
pub mod audio;
pub mod backend;
pub mod config;
pub mod error;
pub mod fallback;
pub mod ipc;
pub mod logging;
pub mod media;
pub mod viewer;

#[cfg(test)]
mod test_support;

pub use error::{BackendError, ErrorKind, ViewerError};
