//! Tombstone garbage collection policy.
//!
//! Collection is content-only: a purged tombstone keeps its id, length and
//! neighbor links so later items can still reference it as an origin.
//! Only tombstones below the replica floor (a state vector every known
//! replica has reached) are eligible.

use std::sync::Arc;

pub use crate::store::GcCandidate;

/// Eligibility predicate for tombstone purging.
pub type GcFilter = Arc<dyn Fn(&GcCandidate<'_>) -> bool + Send + Sync>;

/// When deleted content may be discarded.
#[derive(Clone, Default)]
pub enum GcPolicy {
    /// Keep every tombstone's content.
    #[default]
    Never,
    /// Purge tombstones the predicate accepts.
    Filter(GcFilter),
}

impl GcPolicy {
    /// Purge every eligible tombstone.
    pub fn always() -> Self {
        GcPolicy::Filter(Arc::new(|_| true))
    }

    pub fn filter(f: impl Fn(&GcCandidate<'_>) -> bool + Send + Sync + 'static) -> Self {
        GcPolicy::Filter(Arc::new(f))
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, GcPolicy::Filter(_))
    }
}

impl std::fmt::Debug for GcPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GcPolicy::Never => write!(f, "GcPolicy::Never"),
            GcPolicy::Filter(_) => write!(f, "GcPolicy::Filter(..)"),
        }
    }
}
