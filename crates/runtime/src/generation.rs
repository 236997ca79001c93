use serde::{Deserialize, Serialize};

/// Viewport generation.
///
/// Incremented on every event that invalidates outstanding requests (pan,
/// zoom, selection change, peer filter change). Requests are stamped with the
/// generation current at issue time; a completion carrying an older
/// generation must not be merged.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// `true` when a response stamped with `self` is superseded by `current`.
    pub fn is_stale(self, current: Generation) -> bool {
        self != current
    }
}
