//! Admin state machine and action manager.
//!
//! `AdminState` is a finite enum with an explicit transition table, rather
//! than inheritance over "initiator" types: a tagged action plus a handler
//! table is easier to exhaustively check than a class hierarchy.

use serde::{Deserialize, Serialize};

use crate::error::{DepotError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdminState {
    Normal,
    Loading,
    LoadingForRecovery,
    LoadingForRebuild,
    Saving,
    Flushing,
    Rebuilding,
    Suspending,
    Suspended,
    Resuming,
    ReadOnly,
}

impl AdminState {
    /// New allocation/mutation requests fail with `Quiescent` while
    /// draining or suspended; `ReadOnly` is absorbing and fails with a
    /// distinct error.
    pub fn is_quiescent(self) -> bool {
        matches!(
            self,
            AdminState::Suspending | AdminState::Suspended | AdminState::Flushing
        )
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, AdminState::ReadOnly)
    }

    /// Returns `Ok(new_state)` if the transition is legal, else `BadState`.
    /// `ReadOnly` is reachable from every state (forced by corruption/lock
    /// errors) and, once entered, only `Loading*` (a fresh load) exits it.
    pub fn transition(self, to: AdminState) -> Result<AdminState> {
        use AdminState::*;
        let legal = match (self, to) {
            (_, ReadOnly) => true,
            (ReadOnly, Loading | LoadingForRecovery | LoadingForRebuild) => true,
            // A corrupted depot must still be able to quiesce cleanly
            //.
            (ReadOnly, Suspending) => true,
            (ReadOnly, _) => false,
            (Normal, Flushing | Saving) => true,
            (Normal, Suspending) => true,
            // A live depot can be asked to re-run a load phase (e.g. after
            // the owning process restarts and reopens the same depot in
            // `load-recovery` mode) without first being torn down
            //.
            (Normal, Loading | LoadingForRecovery | LoadingForRebuild) => true,
            (Flushing, Normal) => true,
            (Saving, Normal) => true,
            (Suspending, Suspended) => true,
            (Suspended, Resuming) => true,
            (Resuming, Normal) => true,
            (Loading | LoadingForRecovery | LoadingForRebuild, Normal) => true,
            (Rebuilding, Normal) => true,
            (LoadingForRebuild, Rebuilding) => true,
            (s, t) if s == t => true,
            _ => false,
        };
        if legal {
            Ok(to)
        } else {
            Err(DepotError::BadState { from: self, to })
        }
    }
}

/// A depot-wide administrative operation, fanned out as one `ZoneAction`
/// per zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneAction {
    LoadNormal,
    LoadRecovery,
    LoadRebuild,
    PrepareToAllocate,
    Drain,
    Resume,
    Scrub,
    Grow,
    ReleaseTailLocks { recovery_block: u64 },
}

/// Per-zone outcome of a fanned-out action; partial failures are preserved
/// rather than aborting the remaining zones.
#[derive(Debug)]
pub struct ZoneActionResult {
    pub zone: u32,
    pub result: Result<()>,
}

/// Sequences a `ZoneAction` across zone 0..N, chaining zone `k`'s completion
/// to dispatch zone `k+1`. This struct
/// only tracks progress; it does not itself know how to run an action on a
/// zone -- that is supplied as a closure by the caller (the depot), which is
/// the only thing with zone handles.
pub struct ActionManager {
    in_flight_zone: Option<u32>,
    results: Vec<ZoneActionResult>,
}

impl Default for ActionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionManager {
    pub fn new() -> Self {
        Self {
            in_flight_zone: None,
            results: Vec::new(),
        }
    }

    pub fn in_flight_zone(&self) -> Option<u32> {
        self.in_flight_zone
    }

    /// Run `action` across zones `0..zone_count`, calling `run_on_zone` for
    /// each. Every zone runs regardless of earlier failures; the worst error
    /// per zone is preserved in the returned results.
    pub fn fan_out(
        &mut self,
        zone_count: u32,
        action: ZoneAction,
        mut run_on_zone: impl FnMut(u32, ZoneAction) -> Result<()>,
    ) -> &[ZoneActionResult] {
        self.begin();
        for zone in 0..zone_count {
            self.begin_zone(zone);
            self.record_result(zone, run_on_zone(zone, action));
        }
        self.finish()
    }

    /// Start a new fan-out; used directly by callers (e.g. `SlabDepot`) that
    /// drive each zone asynchronously rather than through a synchronous
    /// closure, but still want the same "dispatch zone k, then k+1" bookkeeping.
    pub fn begin(&mut self) {
        self.results.clear();
    }

    pub fn begin_zone(&mut self, zone: u32) {
        self.in_flight_zone = Some(zone);
    }

    pub fn record_result(&mut self, zone: u32, result: Result<()>) {
        self.results.push(ZoneActionResult { zone, result });
    }

    pub fn finish(&mut self) -> &[ZoneActionResult] {
        self.in_flight_zone = None;
        &self.results
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.result.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_to_suspending_to_suspended_to_resuming_to_normal() {
        let s = AdminState::Normal;
        let s = s.transition(AdminState::Suspending).unwrap();
        let s = s.transition(AdminState::Suspended).unwrap();
        let s = s.transition(AdminState::Resuming).unwrap();
        let s = s.transition(AdminState::Normal).unwrap();
        assert_eq!(s, AdminState::Normal);
    }

    #[test]
    fn illegal_transition_is_bad_state() {
        let s = AdminState::Suspended;
        assert!(matches!(
            s.transition(AdminState::Flushing),
            Err(DepotError::BadState { .. })
        ));
    }

    #[test]
    fn any_state_can_enter_read_only() {
        for s in [
            AdminState::Normal,
            AdminState::Loading,
            AdminState::Suspended,
            AdminState::Resuming,
        ] {
            assert_eq!(s.transition(AdminState::ReadOnly).unwrap(), AdminState::ReadOnly);
        }
    }

    #[test]
    fn read_only_only_exits_via_load() {
        let s = AdminState::ReadOnly;
        assert!(s.transition(AdminState::Normal).is_err());
        assert!(s.transition(AdminState::Loading).is_ok());
    }

    #[test]
    fn fan_out_visits_every_zone_even_after_a_failure() {
        let mut manager = ActionManager::new();
        let results = manager.fan_out(3, ZoneAction::Drain, |zone, _action| {
            if zone == 1 {
                Err(DepotError::Io(std::io::Error::other("boom")))
            } else {
                Ok(())
            }
        });
        assert_eq!(results.len(), 3);
        assert!(results[0].result.is_ok());
        assert!(results[1].result.is_err());
        assert!(results[2].result.is_ok());
    }
}
