//! Image references of the form `[repository/]name[:tag]`

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Repository sentinel for images without an explicit repository
pub const NO_REPOSITORY: &str = "_";

/// Tag used when a reference does not name one
pub const DEFAULT_TAG: &str = "latest";

/// Alternatives in precedence order:
/// `repository/name:tag`, `name:tag`, `repository/name`, `name`
const IMAGE_PATTERN: &str = r"^(.+)/(.+):(.+)$|^(.+):(.+)$|^(.+)/(.+)$|^(.+)$";

fn image_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(IMAGE_PATTERN).expect("valid image reference pattern"))
}

/// A parsed container image reference
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: &str, name: &str, tag: &str) -> Self {
        Self {
            repository: repository.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Parse a free-form image identifier.
    ///
    /// Parsing never fails: input that cannot be split yields empty fields,
    /// which callers detect with [`ImageRef::is_empty`]. A missing tag is
    /// normalized to `latest`.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.is_empty() {
            return Self::default();
        }

        let Some(caps) = image_pattern().captures(input) else {
            return Self::default();
        };
        let group = |i: usize| caps.get(i).map(|m| m.as_str());

        if let (Some(repository), Some(name), Some(tag)) = (group(1), group(2), group(3)) {
            Self::new(repository, name, tag)
        } else if let (Some(name), Some(tag)) = (group(4), group(5)) {
            Self::new(NO_REPOSITORY, name, tag)
        } else if let (Some(repository), Some(name)) = (group(6), group(7)) {
            Self::new(repository, name, DEFAULT_TAG)
        } else if let Some(name) = group(8) {
            Self::new(NO_REPOSITORY, name, DEFAULT_TAG)
        } else {
            Self::default()
        }
    }

    /// True when parsing produced no usable image name
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    pub fn has_repository(&self) -> bool {
        !self.repository.is_empty() && self.repository != NO_REPOSITORY
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = if self.tag.is_empty() { DEFAULT_TAG } else { &self.tag };
        if self.has_repository() {
            write!(f, "{}/{}:{}", self.repository, self.name, tag)
        } else {
            write!(f, "{}:{}", self.name, tag)
        }
    }
}
