//! # Error Handling
//!
//! This module defines the centralized error type for `pkglink`. It uses the
//! `thiserror` library to create an `Error` enum covering every failure mode
//! of resolution, reading, compiling and linking, with enough context (href,
//! module id, dependency chain) for the topmost caller to locate the failing
//! reference.
//!
//! ## Key Components
//!
//! - **`Error`**: The main enum. Resolution-phase variants are fatal to the
//!   package that contains the failing reference and propagate to every
//!   package that includes or maps it, wrapped in `Error::Dependency` at each
//!   step so the final message reads as a chain.
//!
//! - **`Result<T>`**: A type alias for `std::result::Result<T, Error>`.
//!
//! Memo tables settle a failed resolution once and hand the same failure to
//! every requester through `Error::Shared`; nothing in this crate retries.

use std::sync::Arc;

use thiserror::Error;

/// Main error type for pkglink operations
#[derive(Error, Debug)]
pub enum Error {
    /// A reference uses a scheme or shape this resolver does not understand.
    #[error("Unsupported reference {reference}: {message}")]
    ReferenceUnsupported { reference: String, message: String },

    /// A manifest, file, directory, or named package could not be found.
    #[error("Not found: {href}: {message}")]
    NotFound { href: String, message: String },

    /// A manifest failed to parse or is not marked as compatible.
    ///
    /// Optionally carries a hint about how to fix the manifest.
    #[error("Invalid manifest in {href}: {message}{}", hint.as_ref().map(|h| format!("\n  hint: {}", h)).unwrap_or_default())]
    ManifestInvalid {
        href: String,
        message: String,
        /// Optional hint for how to fix the manifest
        hint: Option<String>,
    },

    /// A named dependency has no installation directory in its registry.
    #[error("Dependency {name} is not installed in registry {registry}")]
    NotInstalled { name: String, registry: String },

    /// A named dependency is installed but no version satisfies the predicate.
    #[error("No installed version of {name} satisfies {predicate:?} (installed: {})", installed.join(", "))]
    VersionUnsatisfiable {
        name: String,
        predicate: String,
        installed: Vec<String>,
    },

    /// A compiler collaborator rejected a module.
    #[error("Compile error in module {id:?} of {href}: {message}")]
    Compile {
        href: String,
        id: String,
        message: String,
    },

    /// A module identifier was requested that no factory provides.
    #[error("Can't load module {id:?}{}", href.as_ref().map(|h| format!(" from {}", h)).unwrap_or_default())]
    ModuleNotFound { id: String, href: Option<String> },

    /// A module factory failed while being evaluated.
    #[error("Evaluation of module {id:?} failed: {message}")]
    Evaluation { id: String, message: String },

    /// A pass needed file content that the read pass has not attached.
    #[error("Content of {path} in {href} has not been read")]
    NotRead { href: String, path: String },

    /// A file expected to be an archive could not be decoded.
    #[error("Archive error for {href}: {message}")]
    Archive { href: String, message: String },

    /// A network transport failure.
    #[error("Network operation error: {url} - {message}")]
    Network { url: String, message: String },

    /// An error from a filesystem collaborator.
    #[error("Filesystem operation error: {message}")]
    Filesystem { message: String },

    /// A dependency of `href` failed to resolve.
    #[error("{href} -> {source}")]
    Dependency {
        href: String,
        #[source]
        source: Box<Error>,
    },

    /// A failure settled in a memo table and shared with this requester.
    #[error(transparent)]
    Shared(Arc<Error>),

    /// An error indicating that a mutex or other lock has been poisoned.
    #[error("Lock poisoned: {context}")]
    LockPoisoned { context: String },

    /// An I/O error, wrapped from `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON parsing error, wrapped from `serde_json::Error`.
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// A YAML parsing error, wrapped from `serde_yaml::Error`.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A TOML parsing error, wrapped from `toml::de::Error`.
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A regular expression error, wrapped from `regex::Error`.
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// A URL parsing error, wrapped from `url::ParseError`.
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// A zip decoding error, wrapped from `zip::result::ZipError`.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl Error {
    /// Wraps this error as the failure of a dependency required by `href`.
    pub fn within(self, href: &str) -> Self {
        Error::Dependency {
            href: href.to_string(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, looking through dependency and shared
    /// wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Dependency { source, .. } => source.root_cause(),
            Error::Shared(shared) => shared.root_cause(),
            other => other,
        }
    }

    /// Returns true when the root cause is a not-found failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::NotFound { .. } | Error::NotInstalled { .. } | Error::ModuleNotFound { .. }
        )
    }
}

/// A convenient type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
