//! Unit of work for datarepo.
//!
//! A [`UnitOfWork`] owns one store connection for the duration of a request.
//! It executes compiled [`QueryPlan`](datarepo_query::QueryPlan)s, maps
//! their rows onto entities, and tracks every instance it hands out.
//!
//! # Design Philosophy
//!
//! - **One row, one instance**: the identity map returns the same
//!   [`Managed`](datarepo_core::Managed) handle for every read of a row
//! - **Write-behind**: saves, deletes and field changes are collected and
//!   written at flush, in foreign-key order
//! - **Auto-flush**: pending changes are flushed before a query runs, so
//!   queries see the unit of work's own writes
//! - **Explicit laziness**: references are resolved through
//!   [`UnitOfWork::resolve`], and repeated resolutions are reported by the
//!   N+1 detector
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::begin(pool.acquire()?, catalog, SessionConfig::default())?;
//!
//! // INSERTed on flush
//! let team = uow.save(Team::new("teamA"))?;
//!
//! // Get by primary key (uses identity map)
//! let same = uow.find_by_id::<Team>(team.borrow().id)?;
//!
//! // Dirty-checked against the load snapshot
//! same.unwrap().borrow_mut().name = "teamB".into();
//!
//! uow.commit()?;
//! ```

mod identity;
pub mod n1_detection;
mod projection;
mod unit_of_work;

#[cfg(test)]
mod testing;

use serde::{Deserialize, Serialize};

pub use identity::{ObjectKey, ObjectState};
pub use n1_detection::{CallSite, N1QueryTracker, N1Stats};
pub use projection::Projection;
pub use unit_of_work::{QueryHints, UnitOfWork, UnitOfWorkDebugInfo, UnitOfWorkState};

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for unit-of-work behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Flush pending changes before queries and bulk statements.
    #[serde(default = "default_auto_flush")]
    pub auto_flush: bool,
    /// Lazy resolutions of one relationship before an N+1 warning.
    #[serde(default = "default_n1_threshold")]
    pub n1_threshold: usize,
}

fn default_auto_flush() -> bool {
    true
}

fn default_n1_threshold() -> usize {
    3
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_flush: default_auto_flush(),
            n1_threshold: default_n1_threshold(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert!(config.auto_flush);
        assert_eq!(config.n1_threshold, 3);
    }

    #[test]
    fn test_session_config_partial_deserialize() {
        let config: SessionConfig = serde_json::from_str(r#"{"auto_flush": false}"#).unwrap();
        assert!(!config.auto_flush);
        assert_eq!(config.n1_threshold, 3);
    }
}
