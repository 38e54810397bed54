#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP client error: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("storage error: {reason}")]
    Storage { reason: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },
}

impl RelayError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    /// The stream-level failure this error surfaces as, if any.
    pub fn stream_kind(&self) -> Option<StreamErrorKind> {
        match self {
            Self::InvalidUrl { .. } => Some(StreamErrorKind::InvalidUrl),
            _ => None,
        }
    }
}

/// Failures surfaced to the application layer. Each one stops the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamErrorKind {
    #[error("upstream playlist stopped changing")]
    PlaylistUnchanged,

    #[error("upstream playlist is unavailable")]
    PlaylistUnavailable,

    #[error("upstream playlist not found")]
    PlaylistNotFound,

    #[error("upstream playlist is empty")]
    PlaylistIsEmpty,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid source URL")]
    InvalidUrl,

    #[error("access denied")]
    AccessDenied,
}

impl StreamErrorKind {
    pub fn code(&self) -> i32 {
        match self {
            Self::PlaylistUnchanged => -1,
            Self::PlaylistUnavailable => -2,
            Self::PlaylistNotFound => -3,
            Self::PlaylistIsEmpty => -4,
            Self::AuthenticationFailed => -5,
            Self::InvalidUrl => -6,
            Self::AccessDenied => -7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_url_maps_to_stream_kind() {
        let err = RelayError::invalid_url("::", "relative URL without a base");
        assert_eq!(err.stream_kind(), Some(StreamErrorKind::InvalidUrl));
        assert!(err.to_string().contains("::"));
        assert_eq!(RelayError::storage("disk full").stream_kind(), None);
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(StreamErrorKind::PlaylistUnchanged.code(), -1);
        assert_eq!(StreamErrorKind::PlaylistNotFound.code(), -3);
        assert_eq!(StreamErrorKind::AccessDenied.code(), -7);
    }
}
