//! Pluggable transient-error classification (§4.4): connection timeouts,
//! transport resets, and driver-reported transient codes are retryable;
//! logical errors are not.

use meridian_core::CatalogError;
use std::sync::Arc;

/// Decides whether an error observed while executing an operation is
/// worth retrying.
pub trait TransientErrorDetector<E>: Send + Sync {
    fn is_transient(&self, error: &E) -> bool;
}

impl<E, T: TransientErrorDetector<E> + ?Sized> TransientErrorDetector<E> for Arc<T> {
    fn is_transient(&self, error: &E) -> bool {
        (**self).is_transient(error)
    }
}

/// The default detector used when a caller does not supply a custom one
/// (`RetryBehavior::Default`, §6). Classifies the [`CatalogError`] kinds
/// that represent transport-level failures as transient; everything else
/// (constraint violations, lock mismatches, argument errors) is not.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransientErrorDetector;

impl TransientErrorDetector<CatalogError> for DefaultTransientErrorDetector {
    fn is_transient(&self, error: &CatalogError) -> bool {
        matches!(error, CatalogError::Timeout | CatalogError::InternalError { .. })
    }
}

/// Wraps a plain closure as a [`TransientErrorDetector`], for tests and
/// callers that do not want to define a named type.
pub struct FnDetector<F>(pub F);

impl<E, F> TransientErrorDetector<E> for FnDetector<F>
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn is_transient(&self, error: &E) -> bool {
        (self.0)(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_detector_classifies_timeout_as_transient() {
        let d = DefaultTransientErrorDetector;
        assert!(d.is_transient(&CatalogError::Timeout));
        assert!(!d.is_transient(&CatalogError::MappingLockOwnerIdDoesNotMatch));
    }
}
