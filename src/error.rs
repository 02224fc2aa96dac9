use std::fmt;

use thiserror::Error;

/// The error returned when pushing onto a full [`bounded::Queue`].
///
/// Carries the value that could not be pushed.
///
/// [`bounded::Queue`]: crate::bounded::Queue
#[derive(Clone, Copy, PartialEq, Eq, Error)]
#[error("queue is full")]
pub struct Full<T>(pub T);

impl<T> Full<T> {
    /// Takes back the value that could not be pushed.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}
