//! Success-value-or-error-code container returned by handle accessors.
//!
//! Backend lookups such as [`crate::backend::Context::find_device`] return an
//! [`Outcome`] rather than an `Option`, so every call site has to check which state
//! it holds before pulling the value out. Asking for the wrong side is a programming
//! defect and panics with a diagnostic; [`Outcome::try_data`] and
//! [`Outcome::try_error`] are the non-panicking forms.

use crate::error::{Errno, LinkError, LinkResult};

/// Either a valid value or a (negative) error code, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "an Outcome must be checked with ok() before use"]
pub enum Outcome<T> {
    /// Lookup succeeded.
    Valid(T),
    /// Lookup failed with this code.
    Failed(i32),
}

impl<T> Outcome<T> {
    /// Success state.
    pub fn valid(value: T) -> Self {
        Outcome::Valid(value)
    }

    /// Failure state holding `code` exactly as given.
    pub fn failed(code: i32) -> Self {
        Outcome::Failed(code)
    }

    /// Failure state from a backend errno.
    pub fn from_errno(errno: Errno) -> Self {
        Outcome::Failed(errno.as_code())
    }

    /// True when a value is held.
    pub fn ok(&self) -> bool {
        matches!(self, Outcome::Valid(_))
    }

    /// The held value.
    ///
    /// # Panics
    /// Panics when called on a failure state.
    #[track_caller]
    pub fn data(self) -> T {
        match self {
            Outcome::Valid(value) => value,
            #[allow(clippy::panic)]
            Outcome::Failed(code) => {
                panic!("Outcome::data() called on failure state (code {code})")
            }
        }
    }

    /// The held error code.
    ///
    /// # Panics
    /// Panics when called on a success state.
    #[track_caller]
    pub fn error(&self) -> i32 {
        match self {
            Outcome::Failed(code) => *code,
            #[allow(clippy::panic)]
            Outcome::Valid(_) => panic!("Outcome::error() called on success state"),
        }
    }

    /// The held value, or `LinkError::Usage` on a failure state.
    pub fn try_data(self) -> LinkResult<T> {
        match self {
            Outcome::Valid(value) => Ok(value),
            Outcome::Failed(_) => Err(LinkError::Usage("data() called on failure state")),
        }
    }

    /// The held code, or `LinkError::Usage` on a success state.
    pub fn try_error(&self) -> LinkResult<i32> {
        match self {
            Outcome::Failed(code) => Ok(*code),
            Outcome::Valid(_) => Err(LinkError::Usage("error() called on success state")),
        }
    }

    /// Convert into a std result carrying the errno, for use with `?`.
    pub fn into_result(self) -> Result<T, Errno> {
        match self {
            Outcome::Valid(value) => Ok(value),
            Outcome::Failed(code) => Err(Errno::from_code(code)),
        }
    }

    /// Map the success value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Valid(value) => Outcome::Valid(f(value)),
            Outcome::Failed(code) => Outcome::Failed(code),
        }
    }
}

impl<T> From<Result<T, Errno>> for Outcome<T> {
    fn from(value: Result<T, Errno>) -> Self {
        match value {
            Ok(v) => Outcome::Valid(v),
            Err(errno) => Outcome::from_errno(errno),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_state_holds_exact_value() {
        let outcome = Outcome::valid(42_usize);
        assert!(outcome.ok());
        assert_eq!(outcome.data(), 42);
    }

    #[test]
    fn failure_state_holds_exact_code() {
        let outcome: Outcome<usize> = Outcome::failed(-19);
        assert!(!outcome.ok());
        assert_eq!(outcome.error(), -19);

        // The code is kept as given, whatever its sign
        let outcome: Outcome<&str> = Outcome::failed(5);
        assert!(!outcome.ok());
        assert_eq!(outcome.error(), 5);
        assert_eq!(outcome.into_result(), Err(Errno::EIO));
    }

    #[test]
    #[should_panic(expected = "failure state")]
    fn data_on_failure_panics() {
        let outcome: Outcome<&str> = Outcome::failed(-5);
        let _ = outcome.data();
    }

    #[test]
    #[should_panic(expected = "success state")]
    fn error_on_success_panics() {
        let outcome = Outcome::valid("dev");
        let _ = outcome.error();
    }

    #[test]
    fn try_accessors_report_usage_errors() {
        let failed: Outcome<u8> = Outcome::from_errno(Errno::ENODEV);
        assert!(matches!(failed.try_error(), Ok(-19)));
        assert!(matches!(failed.try_data(), Err(LinkError::Usage(_))));

        let valid = Outcome::valid(7_u8);
        assert!(matches!(valid.try_error(), Err(LinkError::Usage(_))));
        assert_eq!(valid.into_result(), Ok(7));
    }
}
