//! Engine handles stored in host structures

use rquickjs::Persistent;

/// A [`Persistent`] engine handle that can sit in state shared with the tick
/// thread and worker threads
///
/// The handle points into a runtime that is not thread-safe on its own. Every
/// restore, clone and drop of a `Saved` value must happen inside
/// `Context::with` of the context it was saved from, which holds the runtime
/// lock for the duration.
pub struct Saved<T>(Persistent<T>);

// SAFETY: access is serialised by the runtime lock, see above.
unsafe impl<T> Send for Saved<T> {}
// SAFETY: `&Saved` exposes nothing but `Clone`, which runs under the same lock.
unsafe impl<T> Sync for Saved<T> {}

impl<T> Saved<T> {
    pub fn new(handle: Persistent<T>) -> Self {
        Self(handle)
    }

    pub fn into_inner(self) -> Persistent<T> {
        self.0
    }
}

impl<T: Clone> Clone for Saved<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
