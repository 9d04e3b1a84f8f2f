use std::sync::Arc;

use md5::{Digest, Md5};

/// Maps cache keys to file names.
///
/// Cache keys are arbitrary strings that may contain characters which are not allowed in file
/// names, or be arbitrarily long. The file name is the hex-formatted MD5 hash of the UTF-8 key,
/// followed by the configured extension, e.g. `0cc175b9c0f1b6a831c399e269772661.json`.
///
/// **NOTE**: The mapping has to be stable across releases, as it would otherwise orphan all the
/// files referenced from a persisted manifest.
#[derive(Debug, Clone)]
pub struct NameMapper {
    extension: Arc<str>,
}

impl NameMapper {
    pub fn new(extension: &str) -> Self {
        Self {
            extension: extension.into(),
        }
    }

    /// Returns the file name for `key`.
    pub fn file_name(&self, key: &str) -> String {
        let hash = Md5::digest(key.as_bytes());
        let mut name = hex::encode(hash);
        name.push_str(&self.extension);
        name
    }
}
