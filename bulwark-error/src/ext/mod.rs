use std::error::Error;
use std::fmt::Display;

mod context;

mod opaque;
pub use opaque::OpaqueError;
pub(crate) use opaque::MessageError;

/// Attach a context message to the failure case of a `Result` or `Option`,
/// turning it into an [`OpaqueError`].
///
/// ```
/// use bulwark_error::ErrorContext;
///
/// let weight = "heavy".parse::<u32>().context("parse endpoint weight");
/// assert_eq!(
///     weight.unwrap_err().to_string(),
///     "parse endpoint weight: invalid digit found in string",
/// );
///
/// let missing = None::<u32>.context("lookup endpoint weight");
/// assert_eq!(
///     missing.unwrap_err().to_string(),
///     "lookup endpoint weight: Option is None",
/// );
/// ```
pub trait ErrorContext: private::Sealed {
    /// The value carried by the success case.
    type Value;

    /// Attach `context` to the failure case.
    fn context<M>(self, context: M) -> Result<Self::Value, OpaqueError>
    where
        M: Display + Send + Sync + 'static;

    /// Attach the context produced by `context`, only computed on failure.
    fn with_context<M, F>(self, context: F) -> Result<Self::Value, OpaqueError>
    where
        M: Display + Send + Sync + 'static,
        F: FnOnce() -> M;
}

impl<T, E> ErrorContext for Result<T, E>
where
    E: Error + Send + Sync + 'static,
{
    type Value = T;

    fn context<M>(self, context: M) -> Result<T, OpaqueError>
    where
        M: Display + Send + Sync + 'static,
    {
        self.map_err(|error| wrap(context, error))
    }

    fn with_context<M, F>(self, context: F) -> Result<T, OpaqueError>
    where
        M: Display + Send + Sync + 'static,
        F: FnOnce() -> M,
    {
        self.map_err(|error| wrap(context(), error))
    }
}

impl<T> ErrorContext for Option<T> {
    type Value = T;

    fn context<M>(self, context: M) -> Result<T, OpaqueError>
    where
        M: Display + Send + Sync + 'static,
    {
        self.ok_or_else(|| wrap(context, MessageError("Option is None")))
    }

    fn with_context<M, F>(self, context: F) -> Result<T, OpaqueError>
    where
        M: Display + Send + Sync + 'static,
        F: FnOnce() -> M,
    {
        self.ok_or_else(|| wrap(context(), MessageError("Option is None")))
    }
}

fn wrap<M, E>(context: M, error: E) -> OpaqueError
where
    M: Display + Send + Sync + 'static,
    E: Error + Send + Sync + 'static,
{
    OpaqueError::from_std(context::ContextError { context, error })
}

mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> where E: std::error::Error + Send + Sync + 'static {}
    impl<T> Sealed for Option<T> {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct ProviderUnreachable;

    impl fmt::Display for ProviderUnreachable {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("provider unreachable")
        }
    }

    impl Error for ProviderUnreachable {}

    #[test]
    fn context_is_prefixed() {
        let error = Err::<(), _>(ProviderUnreachable)
            .context("dispatch call")
            .unwrap_err();
        assert_eq!(error.to_string(), "dispatch call: provider unreachable");
    }

    #[test]
    fn with_context_is_lazy_on_success() {
        let value = Some(7)
            .with_context(|| -> String { panic!("context computed on success") })
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn missing_value_gets_context() {
        let error = None::<u32>
            .with_context(|| format!("weight of {}", "10.0.0.1:12200"))
            .unwrap_err();
        assert_eq!(error.to_string(), "weight of 10.0.0.1:12200: Option is None");
    }

    #[test]
    fn wrapped_error_stays_reachable_as_source() {
        let error = Err::<(), _>(ProviderUnreachable)
            .context("dispatch call")
            .unwrap_err();
        let cause = error.source().and_then(|source| source.source()).unwrap();
        assert!(cause.is::<ProviderUnreachable>());
    }
}
