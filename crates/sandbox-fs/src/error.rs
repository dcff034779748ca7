use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by sandboxed file operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The requested path would resolve outside the sandbox root.
    #[error("path '{path}' escapes the sandbox root")]
    OutsideSandbox { path: String },

    /// The path contains a component the sandbox refuses to traverse
    /// (absolute prefix, `..`, or an empty segment).
    #[error("path '{path}' contains a rejected component: {component}")]
    RejectedComponent { path: String, component: String },

    /// A symlink was found on the resolved path.
    #[error("path '{path}' traverses a symlink at {link}")]
    SymlinkRejected { path: String, link: PathBuf },

    #[error("io error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
