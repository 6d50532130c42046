use std::error::Error as StdError;
use std::fmt;

/// Marks an error as transient: `RetryWithError` republishes messages whose
/// `Message.error` wraps one of these, everything else passes through
/// untouched. Mirrors the teacher's `PermanentError`/`is_permanent` split in
/// `subscriber.rs`, with the polarity spec.md calls for (retryable is the
/// thing callers opt into, not the default).
#[derive(Debug)]
pub struct RetryError {
    err: Box<dyn StdError + Send + Sync>,
}

impl RetryError {
    pub fn new(err: Box<dyn StdError + Send + Sync>) -> Self {
        Self { err }
    }
}

impl fmt::Display for RetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.err)
    }
}

impl StdError for RetryError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.err)
    }
}

/// Wrap an error so that `RetryWithError` treats the message as transient.
pub fn retryable<E>(err: E) -> Box<dyn StdError + Send + Sync>
where
    E: StdError + Send + Sync + 'static,
{
    Box::new(RetryError::new(Box::new(err)))
}

pub fn is_retryable(err: &(dyn StdError + 'static)) -> bool {
    err.is::<RetryError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;
    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom")
        }
    }
    impl StdError for Boom {}

    #[test]
    fn wrapped_error_is_retryable() {
        let wrapped = retryable(Boom);
        assert!(is_retryable(wrapped.as_ref()));
    }

    #[test]
    fn plain_error_is_not_retryable() {
        let plain: Box<dyn StdError + Send + Sync> = Box::new(Boom);
        assert!(!is_retryable(plain.as_ref()));
    }
}
