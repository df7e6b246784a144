pub mod backup;
pub mod commands;
pub mod datetime_utils;
pub mod download;
pub mod error_utils;
pub mod filename_utils;
pub mod google_photos;
pub mod instagram;
pub mod media;
pub mod pg_store;
pub mod retry;
pub mod retry_queue;
pub mod sink;
pub mod store;
pub mod targets;
pub mod twitter;
