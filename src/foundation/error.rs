/// Convenience result type used across the backdrop cache.
pub type BackdropResult<T> = Result<T, BackdropError>;

/// Top-level error taxonomy used by cache APIs.
///
/// Running out of pinned resources and finding a region in a mixed composited state are not
/// errors; they are reported through [`RequestOutcome`](crate::RequestOutcome).
#[derive(thiserror::Error, Debug)]
pub enum BackdropError {
    /// Invalid caller-provided geometry, colorants or protocol misuse.
    #[error("validation error: {0}")]
    Validation(String),

    /// Memory or pool exhaustion.
    #[error("allocation error: {0}")]
    Allocation(String),

    /// Disk spill or reload failed.
    #[error("disk spill error: {0}")]
    Spill(#[from] std::io::Error),

    /// Wrapped lower-level error from dependencies.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackdropError {
    /// Build a [`BackdropError::Validation`] value.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Build a [`BackdropError::Allocation`] value.
    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::Allocation(msg.into())
    }

    /// Allocation and disk failures abort the current page; everything else is a caller bug.
    pub fn is_allocation_class(&self) -> bool {
        matches!(self, Self::Allocation(_) | Self::Spill(_))
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/error.rs"]
mod tests;
