//! Era: the circular logical clock of an engine.
//!
//! Era numbers live on a circle: `0` follows [`Era::MAX`] and [`Era::MAX`]
//! precedes `0`. A higher number is *not* a later era, so `Era` deliberately
//! implements neither `PartialOrd` nor `Ord`. The only ordering available is
//! reachability through repeated [`Era::next`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// A position on the era circle.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Era(u32);

impl Era {
    /// The initial era of a fresh engine.
    pub const ZERO: Self = Self(0);

    /// The largest era number; its successor is [`Era::ZERO`].
    pub const MAX: Self = Self(u32::MAX);

    /// Create an era from its raw number.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw era number.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Successor on the circle.
    pub const fn next(self) -> Self {
        if self.0 == u32::MAX {
            Self(0)
        } else {
            Self(self.0 + 1)
        }
    }

    /// Predecessor on the circle.
    pub const fn previous(self) -> Self {
        if self.0 == 0 {
            Self(u32::MAX)
        } else {
            Self(self.0 - 1)
        }
    }

    /// Walk `steps` predecessors back.
    pub const fn back(self, steps: u32) -> Self {
        Self(self.0.wrapping_sub(steps))
    }

    /// Number of [`Era::next`] steps needed to reach `target` from `self`.
    pub const fn steps_to(self, target: Era) -> u32 {
        target.0.wrapping_sub(self.0)
    }

    /// Inclusive walk from `self` to `last` following the successor relation.
    ///
    /// Always yields at least one era. When `self == last` the range is that
    /// single era.
    pub fn through(self, last: Era) -> EraRange {
        EraRange {
            next: Some(self),
            last,
        }
    }
}

impl fmt::Debug for Era {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Era({})", self.0)
    }
}

impl fmt::Display for Era {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Era {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl FromStr for Era {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>()
            .map(Self)
            .map_err(|_| CoreError::InvalidEra(s.to_string()))
    }
}

/// Iterator over an inclusive circular era interval.
#[derive(Debug, Clone)]
pub struct EraRange {
    next: Option<Era>,
    last: Era,
}

impl Iterator for EraRange {
    type Item = Era;

    fn next(&mut self) -> Option<Era> {
        let current = self.next?;
        self.next = if current == self.last {
            None
        } else {
            Some(current.next())
        };
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.next {
            None => (0, Some(0)),
            Some(current) => {
                let remaining = current.steps_to(self.last) as usize + 1;
                (remaining, Some(remaining))
            }
        }
    }
}
