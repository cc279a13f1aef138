//! SODAV Monitor detection core
//!
//! Ingests a fleet of live radio streams, identifies the recorded works
//! being broadcast, and records per-station, per-track play durations
//! precise enough to drive royalty distribution.
//!
//! Per station the pipeline is: stream fetch → feature extraction →
//! music gate → fingerprint → local index match → external providers
//! (AcoustID/MusicBrainz, AudD) → identity resolution → play-state
//! tracking → transactional detection + statistics commit.

pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod types;

pub use crate::error::{DetectError, DetectResult};
