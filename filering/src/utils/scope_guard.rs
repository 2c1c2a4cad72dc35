use std::marker::PhantomData;

/// A guard that executes a closure when it goes out of scope.
///
/// The engine uses it to reset its "preparing requests" flag on every exit
/// path of the submission pass, including unwinding out of a user callback
/// that was invoked for a synchronously completed request.
pub(crate) struct ScopeGuard<'a, F: FnOnce()> {
    // Wrapped in an `Option` so the closure can be taken out exactly once.
    closure: Option<F>,

    _p: PhantomData<&'a ()>,
}

impl<'a, F: FnOnce()> ScopeGuard<'a, F> {
    /// Creates a new, armed `ScopeGuard` with the given closure.
    ///
    /// ```ignore
    /// let flag = Rc::new(Cell::new(true));
    /// {
    ///     let flag = Rc::clone(&flag);
    ///     let _guard = ScopeGuard::new(move || flag.set(false));
    /// }
    /// assert!(!flag.get());
    /// ```
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
            _p: PhantomData,
        }
    }
}

impl<'a, F: FnOnce()> Drop for ScopeGuard<'a, F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::rc::Rc;

    #[test]
    fn test_runs_on_scope_exit() {
        let flag = Rc::new(Cell::new(true));

        {
            let flag = Rc::clone(&flag);
            let _guard = ScopeGuard::new(move || flag.set(false));
        }

        assert!(!flag.get());
    }

    #[test]
    fn test_runs_when_unwinding() {
        let count = Rc::new(Cell::new(0));

        let res = catch_unwind(AssertUnwindSafe(|| {
            let count = Rc::clone(&count);
            let _guard = ScopeGuard::new(move || count.set(count.get() + 1));
            panic!("callback blew up");
        }));

        assert!(res.is_err());
        assert_eq!(count.get(), 1);
    }
}
