use std::collections::BTreeMap;

use crate::limits::MAX_RUNS;
use crate::model::*;

use super::EngineError;

/// All runs, by id and by `(species, run type)`.
/// Group members are kept in ascending run id order; that order is the
/// allocator's tie-break.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRegistry {
    runs: BTreeMap<RunNo, RunState>,
    groups: BTreeMap<GroupKey, Vec<RunNo>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a run with the same id is already registered.
    pub fn insert_run(&mut self, run: Run) -> Result<bool, EngineError> {
        if self.runs.contains_key(&run.no) {
            return Ok(false);
        }
        if self.runs.len() >= MAX_RUNS {
            return Err(EngineError::LimitExceeded("too many runs"));
        }
        let members = self.groups.entry(run.group()).or_default();
        let pos = members.partition_point(|n| *n < run.no);
        members.insert(pos, run.no);
        self.runs.insert(run.no, RunState::new(run));
        Ok(true)
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn get(&self, no: RunNo) -> Option<&RunState> {
        self.runs.get(&no)
    }

    pub fn get_mut(&mut self, no: RunNo) -> Option<&mut RunState> {
        self.runs.get_mut(&no)
    }

    pub fn run(&self, no: RunNo) -> Result<&RunState, EngineError> {
        self.get(no).ok_or(EngineError::UnknownRun(no))
    }

    pub fn run_mut(&mut self, no: RunNo) -> Result<&mut RunState, EngineError> {
        self.get_mut(no).ok_or(EngineError::UnknownRun(no))
    }

    /// Run ids of a group, ascending. Empty if the group has no runs.
    pub fn group(&self, key: GroupKey) -> &[RunNo] {
        self.groups.get(&key).map_or(&[], Vec::as_slice)
    }

    pub fn group_keys(&self) -> impl Iterator<Item = GroupKey> + '_ {
        self.groups.keys().copied()
    }

    pub fn runs(&self) -> impl Iterator<Item = &RunState> {
        self.runs.values()
    }

    /// Earliest and latest occupied day over all runs.
    pub fn occupied_span(&self) -> Option<(Day, Day)> {
        let mut span: Option<(Day, Day)> = None;
        for rs in self.runs.values() {
            let (Some(first), Some(last)) =
                (rs.occupancy.keys().next(), rs.occupancy.keys().next_back())
            else {
                continue;
            };
            span = Some(match span {
                None => (*first, *last),
                Some((lo, hi)) => (lo.min(*first), hi.max(*last)),
            });
        }
        span
    }
}
