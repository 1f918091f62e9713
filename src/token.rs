use std::fmt;

/// Associates a registered I/O resource with the handle slot that owns it.
///
/// Internally a `Token` is the handle's index in the loop's slab, handed to
/// the backend as its per-registration user data. When the backend reports a
/// completion the token routes the event back to the owning handle.
///
/// `Token(usize::MAX)` is reserved for the loop's waker.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Token(pub usize);

/// Reserved token used by every backend's wake mechanism.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Token({})", self.0)
    }
}
