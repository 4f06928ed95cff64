use std::fmt;

/// A container image reference as far as the proxy registry cares about it.
///
/// Parsing never fails. Anything that is not a digest or tag reference is kept
/// verbatim as a [`ImageReference::Bare`] repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    Digest { repository: String, digest: String },
    Tagged { repository: String, tag: String },
    Bare { repository: String },
}

impl ImageReference {
    /// Digest form wins when the input has exactly one `@`. Otherwise everything
    /// before the first `:` is the repository, which means `host:5000/repo`
    /// parses as repository `host` with tag `5000/repo`.
    pub fn parse(s: &str) -> Self {
        let parts: Vec<&str> = s.split('@').collect();
        if let [repository, digest] = parts.as_slice() {
            return ImageReference::Digest {
                repository: repository.to_string(),
                digest: digest.to_string(),
            };
        }

        match s.split_once(':') {
            Some((repository, tag)) => ImageReference::Tagged {
                repository: repository.to_string(),
                tag: tag.to_string(),
            },
            None => ImageReference::Bare {
                repository: s.to_string(),
            },
        }
    }

    pub fn repository(&self) -> &str {
        match self {
            ImageReference::Digest { repository, .. }
            | ImageReference::Tagged { repository, .. }
            | ImageReference::Bare { repository } => repository,
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageReference::Digest { repository, digest } => write!(f, "{}@{}", repository, digest),
            ImageReference::Tagged { repository, tag } => write!(f, "{}:{}", repository, tag),
            ImageReference::Bare { repository } => write!(f, "{}", repository),
        }
    }
}
