//! Object keys shared by the source and target buckets.
//!
//! A key is the configured prefix joined with the decoded request path, e.g.
//! prefix `production` and path `/prod/app.tar.gz` give
//! `production/prod/app.tar.gz`.

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use std::{borrow::Borrow, fmt};
use thiserror::Error;

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// Characters escaped when a key segment is placed into a URL path.
const SEGMENT_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'+');

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("request path does not name an object")]
    Empty,
    #[error("object key exceeds {MAX_OBJECT_KEY_LEN} bytes")]
    TooLong,
    #[error("request path is not valid UTF-8 after decoding")]
    InvalidEncoding,
    #[error("object key contains a forbidden segment or character")]
    Forbidden,
}

/// A validated, slash-delimited object key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Build a key from the configured prefix and a raw (percent-encoded)
    /// request path. The leading slash of the path is stripped.
    pub fn from_request_path(prefix: &str, raw_path: &str) -> Result<Self, KeyError> {
        let decoded = percent_decode_str(raw_path)
            .decode_utf8()
            .map_err(|_| KeyError::InvalidEncoding)?;
        let path = decoded.trim_start_matches('/');
        if path.is_empty() {
            return Err(KeyError::Empty);
        }

        let prefix = prefix.trim_matches('/');
        let key = if prefix.is_empty() {
            path.to_string()
        } else {
            format!("{prefix}/{path}")
        };
        Self::new(key)
    }

    /// Validate an already-joined key.
    pub fn new(key: impl Into<String>) -> Result<Self, KeyError> {
        let key = key.into();
        if key.is_empty() {
            return Err(KeyError::Empty);
        }
        if key.len() > MAX_OBJECT_KEY_LEN {
            return Err(KeyError::TooLong);
        }
        if key.starts_with('/')
            || key.split('/').any(|segment| segment == ".." || segment == ".")
        {
            return Err(KeyError::Forbidden);
        }
        if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
            return Err(KeyError::Forbidden);
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key as a URL path, each segment percent-encoded.
    pub fn url_path(&self) -> String {
        self.0
            .split('/')
            .map(|segment| utf8_percent_encode(segment, SEGMENT_ENCODE_SET).to_string())
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ObjectKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_prefix_and_strips_leading_slash() {
        let key = ObjectKey::from_request_path("production", "/prod/app.tar.gz").unwrap();
        assert_eq!(key.as_str(), "production/prod/app.tar.gz");
    }

    #[test]
    fn empty_prefix_uses_path_only() {
        let key = ObjectKey::from_request_path("", "/prod/app.tar.gz").unwrap();
        assert_eq!(key.as_str(), "prod/app.tar.gz");
    }

    #[test]
    fn prefix_slashes_are_normalised() {
        let key = ObjectKey::from_request_path("/production/", "/a/b").unwrap();
        assert_eq!(key.as_str(), "production/a/b");
    }

    #[test]
    fn root_path_is_rejected_even_with_prefix() {
        assert_eq!(
            ObjectKey::from_request_path("", "/"),
            Err(KeyError::Empty)
        );
        assert_eq!(
            ObjectKey::from_request_path("production", "/"),
            Err(KeyError::Empty)
        );
    }

    #[test]
    fn percent_encoded_paths_are_decoded() {
        let key = ObjectKey::from_request_path("", "/dir/my%20file.txt").unwrap();
        assert_eq!(key.as_str(), "dir/my file.txt");
        assert_eq!(key.url_path(), "dir/my%20file.txt");
    }

    #[test]
    fn traversal_segments_are_rejected() {
        assert_eq!(
            ObjectKey::from_request_path("", "/a/../secret"),
            Err(KeyError::Forbidden)
        );
        assert_eq!(
            ObjectKey::from_request_path("", "/a/%2e%2e/secret"),
            Err(KeyError::Forbidden)
        );
    }

    #[test]
    fn overlong_keys_are_rejected() {
        let path = format!("/{}", "a".repeat(MAX_OBJECT_KEY_LEN + 1));
        assert_eq!(
            ObjectKey::from_request_path("", &path),
            Err(KeyError::TooLong)
        );
    }

    #[test]
    fn control_characters_are_rejected() {
        for path in ["/a%00b", "/a%0Ab", "/a%7Fb", "/a%5Cb"] {
            assert_eq!(
                ObjectKey::from_request_path("", path),
                Err(KeyError::Forbidden),
                "{path}"
            );
        }
    }
}
