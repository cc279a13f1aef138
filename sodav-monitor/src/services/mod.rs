//! Detection core services
//!
//! One module per pipeline component, wired together per station by
//! [`station_worker`] under the lifecycle management of
//! [`station_supervisor`].

pub mod acoustid_client;
pub mod audd_client;
pub mod external_recognizer;
pub mod feature_extractor;
pub mod fingerprinter;
pub mod local_matcher;
pub mod musicbrainz_client;
pub mod play_tracker;
pub mod station_supervisor;
pub mod station_worker;
pub mod stats_updater;
pub mod stream_checker;
pub mod stream_fetcher;
pub mod track_resolver;
