use std::num::NonZeroU8;
use std::{fmt, ops};

/// Interests used in registering, and readiness reported back in events.
///
/// An `Interest` names the operations a handle wants to be notified about.
/// Registrations only ever ask for [readable] and/or [writable]; the
/// [error] and [hangup] bits are reported by backends unconditionally and
/// show up in [`Event::readiness`].
///
/// [readable]: Interest::READABLE
/// [writable]: Interest::WRITABLE
/// [error]: Interest::ERROR
/// [hangup]: Interest::HANGUP
/// [`Event::readiness`]: crate::event::Event::readiness
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Interest(NonZeroU8);

// These must be unique.
const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const ERROR: u8 = 0b0100;
const HANGUP: u8 = 0b1000;

impl Interest {
    /// Returns an `Interest` set representing readable interests.
    pub const READABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });

    /// Returns an `Interest` set representing writable interests.
    pub const WRITABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITABLE) });

    /// Error readiness. Never requested explicitly; always delivered.
    pub const ERROR: Interest = Interest(unsafe { NonZeroU8::new_unchecked(ERROR) });

    /// Peer-hangup readiness. Never requested explicitly; always delivered.
    pub const HANGUP: Interest = Interest(unsafe { NonZeroU8::new_unchecked(HANGUP) });

    /// Add together two `Interest`s.
    ///
    /// This does the same thing as the `BitOr` implementation, but is a
    /// constant function.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    /// Remove `other` from `self`, returning `None` if nothing is left.
    pub fn remove(self, other: Interest) -> Option<Interest> {
        NonZeroU8::new(self.0.get() & !other.0.get()).map(Interest)
    }

    /// Returns true if the value includes readable readiness.
    pub const fn is_readable(self) -> bool {
        (self.0.get() & READABLE) != 0
    }

    /// Returns true if the value includes writable readiness.
    pub const fn is_writable(self) -> bool {
        (self.0.get() & WRITABLE) != 0
    }

    /// Returns true if the value includes error readiness.
    pub const fn is_error(self) -> bool {
        (self.0.get() & ERROR) != 0
    }

    /// Returns true if the value includes hangup readiness.
    pub const fn is_hangup(self) -> bool {
        (self.0.get() & HANGUP) != 0
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 = (*self | other).0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        for (is_set, name) in [
            (self.is_readable(), "READABLE"),
            (self.is_writable(), "WRITABLE"),
            (self.is_error(), "ERROR"),
            (self.is_hangup(), "HANGUP"),
        ] {
            if is_set {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", name)?;
                one = true
            }
        }
        debug_assert!(one, "printing empty interests");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn add_and_remove() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert_eq!(both.remove(Interest::WRITABLE), Some(Interest::READABLE));
        assert_eq!(Interest::READABLE.remove(Interest::READABLE), None);
    }

    #[test]
    fn debug_output() {
        let both = Interest::READABLE.add(Interest::WRITABLE);
        assert_eq!(format!("{:?}", both), "READABLE | WRITABLE");
    }
}
