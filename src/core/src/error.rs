use thiserror::Error;

/// Why package resolution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionFailure {
    /// No available version satisfies the constraints
    Unsatisfiable,
    /// A repository index carried no signature trusted by the keyring
    Unsigned,
    /// A repository or keyring entry could not be fetched
    Unreachable,
}

impl std::fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsatisfiable => write!(f, "unsatisfiable"),
            Self::Unsigned => write!(f, "unsigned"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Classification of registry failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishFailure {
    /// Timeouts, connection resets, 5xx responses
    Transient,
    /// Authentication or authorization rejected
    Unauthorized,
    /// Repository (or referenced content) does not exist
    NotFound,
    /// Any other rejection; not retried
    Rejected,
}

impl std::fmt::Display for PublishFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::NotFound => write!(f, "not found"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Forge error types
#[derive(Error, Debug)]
pub enum ForgeError {
    /// Malformed manifest
    #[error("Manifest parse error: {0}")]
    ParseError(String),

    /// Package resolution failed
    #[error("Resolution error ({kind}): {message}")]
    ResolutionError {
        kind: ResolutionFailure,
        message: String,
    },

    /// Root filesystem construction failed
    #[error("Assembly error: {0}")]
    AssemblyError(String),

    /// An architecture's image could not be built; the whole build is aborted
    #[error("Build failed for {arch}: {source}")]
    BuildError {
        arch: String,
        #[source]
        source: Box<ForgeError>,
    },

    /// SBOM serialization failed
    #[error("SBOM error: {0}")]
    SbomError(String),

    /// Registry I/O failed
    #[error("Publish error: {registry} ({kind}) - {message}")]
    PublishError {
        registry: String,
        kind: PublishFailure,
        message: String,
    },

    /// A recorded digest no longer resolves in the registry
    #[error("Drift detected for {reference}: {message}")]
    DriftError { reference: String, message: String },

    /// Download of index, package or key failed
    #[error("Fetch error: {url} - {message}")]
    FetchError { url: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl ForgeError {
    /// Shorthand for an unsatisfiable resolution.
    pub fn unsatisfiable(message: impl Into<String>) -> Self {
        Self::ResolutionError {
            kind: ResolutionFailure::Unsatisfiable,
            message: message.into(),
        }
    }

    /// Wrap an error raised while building `arch`.
    pub fn build(arch: impl Into<String>, source: ForgeError) -> Self {
        Self::BuildError {
            arch: arch.into(),
            source: Box::new(source),
        }
    }

    /// Whether a registry operation that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::PublishError {
                kind: PublishFailure::Transient,
                ..
            }
        )
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(err: serde_json::Error) -> Self {
        ForgeError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ForgeError {
    fn from(err: serde_yaml::Error) -> Self {
        ForgeError::SerializationError(err.to_string())
    }
}

/// Result type alias for Forge operations
pub type Result<T> = std::result::Result<T, ForgeError>;
