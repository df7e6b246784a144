pub mod daemon;
pub mod retry_failed;
pub mod show_media;
