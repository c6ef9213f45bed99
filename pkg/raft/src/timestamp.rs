//! Relative millisecond clock wrapping every 2^32 ms (spec.md §2.2).

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// A point in time relative to process start, wrapping every 2^32
/// milliseconds (~49.7 days). Comparisons use a half-window rule (standard
/// sequence-number comparison) so that ordering still makes sense across a
/// single wrap boundary, which spec.md leaves unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelativeTimestamp(pub u32);

impl RelativeTimestamp {
    pub fn now() -> Self {
        let elapsed = Instant::now().duration_since(epoch()).as_millis();
        RelativeTimestamp((elapsed % (1u128 << 32)) as u32)
    }

    /// `self + millis`, wrapping.
    pub fn add_millis(self, millis: u32) -> Self {
        RelativeTimestamp(self.0.wrapping_add(millis))
    }

    /// `self - millis`, wrapping.
    pub fn sub_millis(self, millis: u32) -> Self {
        RelativeTimestamp(self.0.wrapping_sub(millis))
    }

    /// Whether `self` is strictly after `other`, accounting for wraparound:
    /// the timestamp whose wrapping difference from the other lies in the
    /// "positive" half of the u32 range is considered later.
    pub fn is_after(self, other: Self) -> bool {
        let diff = self.0.wrapping_sub(other.0);
        diff != 0 && diff < (1u32 << 31)
    }

    pub fn is_before(self, other: Self) -> bool {
        other.is_after(self)
    }
}

impl PartialOrd for RelativeTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RelativeTimestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self.0 == other.0 {
            std::cmp::Ordering::Equal
        } else if self.is_after(*other) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Less
        }
    }
}
