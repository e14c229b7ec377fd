use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::domain::is_valid_code;
use crate::error::BridgeError;

/// Reads a newline-delimited exclusion list. Lines are trimmed, blank lines skipped, and every
/// remaining entry must be a valid openBIS code.
pub fn read_blacklist(path: &Path) -> Result<HashSet<String>, BridgeError> {
    let content = fs::read_to_string(path)
        .map_err(|err| BridgeError::Filesystem(format!("read {}: {err}", path.display())))?;
    parse_blacklist(&content, path)
}

pub fn parse_blacklist(content: &str, origin: &Path) -> Result<HashSet<String>, BridgeError> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            if is_valid_code(line) {
                Ok(line.to_string())
            } else {
                Err(BridgeError::InvalidBlacklistCode {
                    file: origin.to_path_buf(),
                    code: line.to_string(),
                })
            }
        })
        .collect()
}

/// Like [`read_blacklist`], but an absent path yields an empty set.
pub fn read_optional_blacklist(path: Option<&Path>) -> Result<HashSet<String>, BridgeError> {
    match path {
        Some(path) => read_blacklist(path),
        None => Ok(HashSet::new()),
    }
}
