//! Error primitives shared across the workspace.
#![deny(warnings)]
#![deny(missing_docs)]

use std::fmt::{self, Display};

/// A type-erased error, suitable for propagating failures up to the application boundary.
pub type GenericError = anyhow::Error;

/// Macro for constructing a generic error.
///
/// The resulting value evaluates to [`GenericError`], and can be constructed from a string literal, a format string
/// (with arguments accepted, in the same order as `std::format!`), or a value which implements `Debug` and `Display`,
/// such as an existing error that implements `std::error::Error`.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

// NOTE: We're wrapping `anyhow::Context` because otherwise the extension methods overlap with `snafu::ResultExt`, and
// this is just easier for scenarios where we want both.
/// Extension methods for attaching context to the error side of a `Result`.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wrap the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }
}

/// Several errors that were collected while tearing down, reported together.
///
/// The first error is treated as the primary cause and is exposed as the error source.
#[derive(Debug)]
pub struct MergedErrors {
    errors: Vec<GenericError>,
}

impl MergedErrors {
    /// Returns the individual errors, in the order they were merged.
    pub fn errors(&self) -> &[GenericError] {
        &self.errors
    }
}

impl Display for MergedErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for (idx, error) in self.errors.iter().enumerate() {
            write!(f, " [{}] {:#}", idx + 1, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for MergedErrors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors.first().map(|e| &**e as &(dyn std::error::Error + 'static))
    }
}

/// Merges two optional errors into one.
///
/// If only one of the errors is present, it is returned as-is. If both are present, they are combined into a single
/// [`MergedErrors`] so that neither is silently dropped: this is typically used to report a teardown failure alongside
/// the failure that caused the teardown in the first place.
pub fn merge_errors(primary: Option<GenericError>, secondary: Option<GenericError>) -> Option<GenericError> {
    match (primary, secondary) {
        (None, None) => None,
        (Some(e), None) | (None, Some(e)) => Some(e),
        (Some(primary), Some(secondary)) => {
            let mut errors = Vec::with_capacity(2);
            flatten_into(primary, &mut errors);
            flatten_into(secondary, &mut errors);
            Some(GenericError::new(MergedErrors { errors }))
        }
    }
}

fn flatten_into(error: GenericError, errors: &mut Vec<GenericError>) {
    match error.downcast::<MergedErrors>() {
        Ok(merged) => errors.extend(merged.errors),
        Err(error) => errors.push(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_errors_passthrough() {
        assert!(merge_errors(None, None).is_none());

        let only_primary = merge_errors(Some(generic_error!("serve failed")), None).unwrap();
        assert_eq!(only_primary.to_string(), "serve failed");

        let only_secondary = merge_errors(None, Some(generic_error!("flush failed"))).unwrap();
        assert_eq!(only_secondary.to_string(), "flush failed");
    }

    #[test]
    fn merge_errors_keeps_both() {
        let merged = merge_errors(Some(generic_error!("serve failed")), Some(generic_error!("flush failed"))).unwrap();

        let rendered = merged.to_string();
        assert!(rendered.contains("serve failed"));
        assert!(rendered.contains("flush failed"));

        let inner = merged.downcast_ref::<MergedErrors>().expect("should be merged");
        assert_eq!(inner.errors().len(), 2);
    }

    #[test]
    fn merge_errors_flattens_nested() {
        let first = merge_errors(Some(generic_error!("a")), Some(generic_error!("b")));
        let merged = merge_errors(first, Some(generic_error!("c"))).unwrap();

        let inner = merged.downcast_ref::<MergedErrors>().expect("should be merged");
        let messages = inner.errors().iter().map(|e| e.to_string()).collect::<Vec<_>>();
        assert_eq!(messages, vec!["a", "b", "c"]);
    }

    #[test]
    fn error_context_wraps() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("boom"));
        let err = result.error_context("Failed to do the thing.").unwrap_err();
        assert_eq!(err.to_string(), "Failed to do the thing.");
        assert_eq!(err.root_cause().to_string(), "boom");
    }
}
