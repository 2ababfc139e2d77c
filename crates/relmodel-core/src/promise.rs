//! Deferred, single-assignment values for lazily loaded relations.

use crate::criteria::Criteria;
use crate::error::Result;
use std::fmt;
use std::sync::{Mutex, OnceLock, PoisonError, TryLockError};

/// A value that is loaded on first access.
///
/// The promise carries the scope needed to perform the load; the resolving
/// function is supplied by the caller that owns the data source. Resolution
/// happens at most once: concurrent and later callers get the cached value
/// and never re-issue the load. A failed resolution caches nothing, so a
/// later call may try again.
///
/// # Example
///
/// ```ignore
/// let promise = Promise::new(Criteria::eq("user_id", 1_i64));
/// let posts = promise.resolve_with(|scope| repository.find_all(scope))?;
/// ```
pub struct Promise<T> {
    scope: Criteria,
    value: OnceLock<T>,
    resolving: Mutex<()>,
}

impl<T> Promise<T> {
    /// Create an unresolved promise for the given scope.
    #[must_use]
    pub fn new(scope: Criteria) -> Self {
        Self {
            scope,
            value: OnceLock::new(),
            resolving: Mutex::new(()),
        }
    }

    /// Create a promise that is already resolved.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(value);
        Self {
            scope: Criteria::new(),
            value: cell,
            resolving: Mutex::new(()),
        }
    }

    /// Parameters of the deferred load.
    pub fn scope(&self) -> &Criteria {
        &self.scope
    }

    pub fn is_resolved(&self) -> bool {
        self.value.get().is_some()
    }

    /// The cached value, if resolution already happened.
    pub fn get(&self) -> Option<&T> {
        self.value.get()
    }

    /// Resolve the promise with `resolver`, or return the cached value.
    ///
    /// `resolver` runs at most once across all callers that observe success.
    pub fn resolve_with<F>(&self, resolver: F) -> Result<&T>
    where
        F: FnOnce(&Criteria) -> Result<T>,
    {
        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        let _guard = self
            .resolving
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        let value = resolver(&self.scope)?;
        Ok(self.value.get_or_init(|| value))
    }

    /// Resolve with a value obtained without running the deferred load.
    ///
    /// Returns `false`, leaving the promise untouched, when it is already
    /// resolved or a resolver is running.
    pub fn fulfill(&self, value: T) -> bool {
        if self.value.get().is_some() {
            return false;
        }
        let _guard = match self.resolving.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        self.value.set(value).is_ok()
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value.get() {
            Some(value) => f.debug_tuple("Promise").field(value).finish(),
            None => f
                .debug_struct("Promise")
                .field("scope", &self.scope)
                .field("state", &"pending")
                .finish(),
        }
    }
}
