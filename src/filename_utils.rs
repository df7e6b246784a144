use crate::media::strip_query;
use sanitize_filename::sanitize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Utility functions for generating consistent filenames across the application
///
/// Sanitize and create full file path
pub fn sanitized_file_path(output_dir: &Path, filename: &str) -> PathBuf {
    let sanitized_filename = sanitize(filename);
    output_dir.join(sanitized_filename)
}

/// Local staging path for a media URL
/// Format: download_dir/owner/basename (query string dropped)
pub fn staging_path(download_dir: &Path, owner: &str, media_url: &str) -> PathBuf {
    let without_query = strip_query(media_url);
    let basename = without_query
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("media");

    let owner_dir = sanitized_file_path(download_dir, owner);
    sanitized_file_path(&owner_dir, basename)
}

/// Generate a filename for a backup record
/// Format: tweetid.json
pub fn backup_record_filename(tweet_id: &str) -> String {
    format!("{tweet_id}.json")
}

/// Generate a filename for a failed upload record; URLs are hashed so the
/// URL itself stays the natural key
/// Format: sha256(url).json
pub fn failed_upload_filename(media_url: &str) -> String {
    let digest = Sha256::digest(media_url.as_bytes());
    format!("{hash}.json", hash = hex::encode(digest))
}
