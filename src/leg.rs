//! Direction of travel along a route, as an explicit state machine.
//!
//! A bus shuttles back and forth: it sweeps the waypoints forward to the last
//! one, then backward to the first, then forward again starting at index 1.

/// Direction plus the index of the waypoint currently being targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Forward(usize),
    Reverse(usize),
}

/// Outcome of [`Leg::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    pub leg: Leg,
    /// True when a reverse sweep finished and travel turned forward again.
    pub round_completed: bool,
}

impl Leg {
    pub fn index(self) -> usize {
        match self {
            Leg::Forward(i) | Leg::Reverse(i) => i,
        }
    }

    pub fn is_reversing(self) -> bool {
        matches!(self, Leg::Reverse(_))
    }

    /// Move on to the next waypoint of a route with `len` waypoints.
    ///
    /// The resulting index is always clamped into `[0, len - 1]`.
    pub fn advance(self, len: usize) -> Advance {
        let last = len.saturating_sub(1);
        let (leg, round_completed) = match self {
            Leg::Forward(i) if i + 1 > last => (Leg::Reverse(len.saturating_sub(2)), false),
            Leg::Forward(i) => (Leg::Forward(i + 1), false),
            Leg::Reverse(0) => (Leg::Forward(1), true),
            Leg::Reverse(i) => (Leg::Reverse(i - 1), false),
        };

        Advance {
            leg: leg.clamped(last),
            round_completed,
        }
    }

    fn clamped(self, last: usize) -> Leg {
        match self {
            Leg::Forward(i) => Leg::Forward(i.min(last)),
            Leg::Reverse(i) => Leg::Reverse(i.min(last)),
        }
    }
}

impl Default for Leg {
    fn default() -> Self {
        Leg::Forward(0)
    }
}
