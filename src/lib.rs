//! archive-cache - decompressed archive cache for emulator launches
//!
//! Extracts compressed game archives once, keeps the payload in a
//! size-bounded LRU cache, and hands the launcher a ready-to-run file.

pub mod config;
pub mod extractor;
pub mod game;
pub mod hash;
pub mod index;
pub mod launch;
pub mod manager;
pub mod paths;
pub mod state;
pub mod store;
