use std::time::{Duration, Instant};

/// A point on the monotonic clock against which timed waits are armed.
///
/// Two sentinels extend the plain time point: [`Deadline::unreachable`] never
/// fires and is the default, and [`Deadline::passed`] has already elapsed.
/// Deadlines are totally ordered; unreachable compares greater than any
/// reachable deadline, passed compares less than any future instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline(Kind);

// Variant order defines the total order: already-elapsed sorts first,
// unreachable sorts last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Kind {
    Passed,
    At(Instant),
    Unreachable,
}

impl Deadline {
    /// A deadline that will never be reached.
    pub const fn unreachable() -> Self {
        Deadline(Kind::Unreachable)
    }

    /// A deadline that has already been reached.
    pub const fn passed() -> Self {
        Deadline(Kind::Passed)
    }

    /// A deadline at the given instant.
    pub const fn at(instant: Instant) -> Self {
        Deadline(Kind::At(instant))
    }

    /// A deadline `duration` from now. Saturates to [`Deadline::unreachable`]
    /// if the sum does not fit the clock's domain.
    pub fn from_duration(duration: Duration) -> Self {
        match Instant::now().checked_add(duration) {
            Some(instant) => Deadline(Kind::At(instant)),
            None => Deadline(Kind::Unreachable),
        }
    }

    /// Whether the deadline can fire at all. An already-passed deadline is
    /// reachable.
    pub fn is_reachable(&self) -> bool {
        !matches!(self.0, Kind::Unreachable)
    }

    /// Whether the deadline has elapsed.
    pub fn is_reached(&self) -> bool {
        match self.0 {
            Kind::Passed => true,
            Kind::At(instant) => instant <= Instant::now(),
            Kind::Unreachable => false,
        }
    }

    /// Time remaining until the deadline, zero if it has elapsed.
    ///
    /// Must not be called on an unreachable deadline.
    pub fn time_left(&self) -> Duration {
        debug_assert!(self.is_reachable());
        match self.0 {
            Kind::Passed => Duration::ZERO,
            Kind::At(instant) => instant.saturating_duration_since(Instant::now()),
            Kind::Unreachable => Duration::MAX,
        }
    }

    /// The underlying instant, if the deadline is a plain time point.
    pub fn instant(&self) -> Option<Instant> {
        match self.0 {
            Kind::At(instant) => Some(instant),
            _ => None,
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::unreachable()
    }
}
