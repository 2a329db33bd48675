use std::path::PathBuf;

pub const DEFAULT_CACHE_DIR: &str = ".patchembed_cache";

/// Environment variable overriding [DEFAULT_CACHE_DIR]
pub const CACHE_DIR_ENV: &str = "PATCHEMBED_CACHE_DIR";

/// Type alias for the error type
pub type Error = anyhow::Error;

/// Errors raised while resolving an encoder name or shaping its inputs.
///
/// Public functions return [anyhow::Result]; use `err.downcast_ref::<EncoderError>()`
/// to match on these.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncoderError {
    /// `kaiko-<variant>` where the variant is not a published kaiko.ai ViT
    #[error("unknown kaiko.ai ViT variant: '{0}'")]
    UnknownVariant(String),
    /// `resnet*` other than resnet18/resnet50
    #[error("resnet variant not implemented: '{0}'")]
    NotImplemented(String),
    /// Name outside every encoder family
    #[error("invalid encoder name '{0}'")]
    InvalidName(String),
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// Cache directory used when none is given explicitly.
///
/// Reads [CACHE_DIR_ENV], falling back to [DEFAULT_CACHE_DIR].
pub fn get_cache_dir() -> PathBuf {
    std::env::var(CACHE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CACHE_DIR))
}
