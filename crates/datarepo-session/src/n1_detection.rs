//! N+1 lazy-load detection.
//!
//! The N+1 pattern shows up when code loads N members and then resolves
//! `member.team` one at a time, issuing N extra lookups where a single fetch
//! join would do.
//!
//! ```ignore
//! // Each resolution is recorded; the third one logs a warning.
//! for member in &members {
//!     uow.resolve::<Member, Team>(member, "team")?;
//! }
//!
//! // The fix: declare the method with an entity graph (or a fetch join)
//! // so `team` arrives pre-filled.
//! let members = repo.invoke(uow, find_all_with_team).list()?;
//! ```

use std::collections::HashMap;
use std::panic::Location;
use std::time::Instant;

/// Counts lazy resolutions per `(entity, relationship)` and warns once a
/// pair reaches the threshold.
#[derive(Debug)]
pub struct N1QueryTracker {
    counts: HashMap<(&'static str, &'static str), usize>,
    threshold: usize,
    enabled: bool,
    call_sites: Vec<CallSite>,
}

impl Default for N1QueryTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a lazy resolution was triggered.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub entity: &'static str,
    pub relationship: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub at: Instant,
}

/// Summary counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct N1Stats {
    /// Lazy resolutions recorded.
    pub total_loads: usize,
    /// Distinct `(entity, relationship)` pairs resolved.
    pub relationships_loaded: usize,
    /// Pairs at or above the threshold.
    pub potential_n1: usize,
}

impl N1QueryTracker {
    /// A tracker with the default threshold of 3.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
            threshold: 3,
            enabled: true,
            call_sites: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Record one lazy resolution of `entity.relationship`.
    #[track_caller]
    pub fn record_load(&mut self, entity: &'static str, relationship: &'static str) {
        if !self.enabled {
            return;
        }

        let count = self.counts.entry((entity, relationship)).or_insert(0);
        *count += 1;
        let count = *count;

        let caller = Location::caller();
        self.call_sites.push(CallSite {
            entity,
            relationship,
            file: caller.file(),
            line: caller.line(),
            at: Instant::now(),
        });

        if count == self.threshold {
            self.emit_warning(entity, relationship, count);
        }
    }

    fn emit_warning(&self, entity: &'static str, relationship: &'static str, count: usize) {
        tracing::warn!(
            target: "datarepo::n1",
            entity,
            relationship,
            loads = count,
            threshold = self.threshold,
            "Possible N+1 pattern: `{entity}.{relationship}` resolved lazily {count} times; \
             fetch it with an entity graph or a fetch join"
        );

        for (i, site) in self
            .call_sites
            .iter()
            .filter(|s| s.entity == entity && s.relationship == relationship)
            .take(5)
            .enumerate()
        {
            tracing::debug!(
                target: "datarepo::n1",
                index = i,
                file = site.file,
                line = site.line,
                "lazy resolution site"
            );
        }
    }

    /// Forget every count and call site.
    pub fn reset(&mut self) {
        self.counts.clear();
        self.call_sites.clear();
    }

    #[must_use]
    pub fn count_for(&self, entity: &str, relationship: &str) -> usize {
        self.counts
            .iter()
            .find(|((e, r), _)| *e == entity && *r == relationship)
            .map_or(0, |(_, count)| *count)
    }

    #[must_use]
    pub fn stats(&self) -> N1Stats {
        N1Stats {
            total_loads: self.counts.values().sum(),
            relationships_loaded: self.counts.len(),
            potential_n1: self
                .counts
                .values()
                .filter(|count| **count >= self.threshold)
                .count(),
        }
    }

    #[must_use]
    pub fn call_sites(&self) -> &[CallSite] {
        &self.call_sites
    }
}
