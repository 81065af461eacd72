//! Helper registry: the hub's authoritative view of every helper
//!
//! Pure state. All methods run on the actor task, so there is no locking;
//! side effects are described by the returned plans and carried out by the
//! connection handler afterwards.

use std::collections::BTreeMap;

use brood_core::protocol::HelperSummary;
use brood_core::{BroodError, HelperId, HelperStatus, Numbering, Result, SpawnBudget, DIRECTOR};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::launcher::ProcessHandle;

/// Identifies one client connection to the hub
pub type ConnId = u64;

#[derive(Debug, Clone)]
pub struct HelperRecord {
    pub identity: HelperId,
    pub parent: Option<HelperId>,
    pub status: HelperStatus,
    /// Connection currently subscribed on behalf of this helper
    pub connection: Option<ConnId>,
    pub registered_at: Option<DateTime<Utc>>,
    pub budget: SpawnBudget,
    pub created_at: DateTime<Utc>,
    pub model: Option<String>,
    pub process: Option<ProcessHandle>,
    pub launch_in_flight: bool,
    /// A stop is terminating the previous process
    pub teardown_in_flight: bool,
}

impl HelperRecord {
    fn summary(&self) -> HelperSummary {
        HelperSummary {
            identity: self.identity,
            parent: self.parent,
            status: self.status,
            budget: self.budget,
            subscribed: self.connection.is_some(),
            created_at: self.created_at,
            registered_at: self.registered_at,
            model: self.model.clone(),
            container: self.process.as_ref().map(|p| p.name.clone()),
        }
    }
}

/// Directories to materialize and a process to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub identity: HelperId,
    pub parent: HelperId,
    pub budget: SpawnBudget,
    /// Live siblings at commit time
    pub peers: Vec<HelperId>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopPlan {
    pub identity: HelperId,
    pub process: Option<ProcessHandle>,
    pub connection: Option<ConnId>,
    pub already_stopped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupStep {
    pub identity: HelperId,
    pub process: Option<ProcessHandle>,
    pub connection: Option<ConnId>,
}

pub struct Registry {
    numbering: Numbering,
    records: BTreeMap<HelperId, HelperRecord>,
    shutting_down: bool,
}

impl Registry {
    /// Registry holding only the director, already running
    pub fn new(numbering: Numbering, director_budget: SpawnBudget) -> Self {
        let now = Utc::now();
        let mut records = BTreeMap::new();
        records.insert(
            DIRECTOR,
            HelperRecord {
                identity: DIRECTOR,
                parent: None,
                status: HelperStatus::Running,
                connection: None,
                registered_at: Some(now),
                budget: director_budget,
                created_at: now,
                model: None,
                process: None,
                launch_in_flight: false,
                teardown_in_flight: false,
            },
        );
        Self {
            numbering,
            records,
            shutting_down: false,
        }
    }

    pub fn numbering(&self) -> Numbering {
        self.numbering
    }

    /// Record for `id`, including tombstones
    pub fn get(&self, id: HelperId) -> Result<&HelperRecord> {
        self.records.get(&id).ok_or(BroodError::UnknownIdentity(id))
    }

    fn get_mut(&mut self, id: HelperId) -> Result<&mut HelperRecord> {
        self.records
            .get_mut(&id)
            .ok_or(BroodError::UnknownIdentity(id))
    }

    /// Record for `id` if it exists and has not been cleaned
    pub fn get_live(&self, id: HelperId) -> Result<&HelperRecord> {
        match self.records.get(&id) {
            Some(record) if record.status.is_live() => Ok(record),
            _ => Err(BroodError::UnknownIdentity(id)),
        }
    }

    pub fn is_live(&self, id: HelperId) -> bool {
        self.get_live(id).is_ok()
    }

    pub fn live_children(&self, parent: HelperId) -> Vec<HelperId> {
        let Ok((first, last)) = self.numbering.children_range(parent) else {
            return Vec::new();
        };
        self.records
            .range(first..=last)
            .filter(|(_, r)| r.status.is_live())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Every live helper below `id`, deepest first
    pub fn live_descendants(&self, id: HelperId) -> Vec<HelperId> {
        let mut found: Vec<HelperId> = self
            .records
            .values()
            .filter(|r| r.status.is_live() && self.numbering.is_ancestor_of(id, r.identity))
            .map(|r| r.identity)
            .collect();
        found.sort_by(|a, b| {
            self.numbering
                .depth_of(*b)
                .cmp(&self.numbering.depth_of(*a))
                .then(b.cmp(a))
        });
        found
    }

    fn live_siblings(&self, id: HelperId) -> Vec<HelperId> {
        match self.numbering.parent_of(id) {
            Some(parent) => self
                .live_children(parent)
                .into_iter()
                .filter(|s| *s != id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Allocate the lowest free slot under `parent` and record it as pending
    pub fn reserve_child(
        &mut self,
        parent: HelperId,
        breadth: Option<u32>,
        depth: Option<u32>,
        model: Option<String>,
    ) -> Result<LaunchPlan> {
        self.check_accepting()?;
        let parent_budget = self.get_live(parent)?.budget;

        let mut index = parent_budget.breadth;
        for k in 0..parent_budget.breadth.min(self.numbering.base()) {
            let candidate = self.numbering.nth_child(parent, k)?;
            if !self.is_live(candidate) {
                index = k;
                break;
            }
        }

        let (identity, budget) =
            self.numbering
                .allocate_child(parent, index, parent_budget, breadth, depth)?;
        let peers = self.live_children(parent);

        // Tombstones in this slot are replaced
        self.records.insert(
            identity,
            HelperRecord {
                identity,
                parent: Some(parent),
                status: HelperStatus::Pending,
                connection: None,
                registered_at: None,
                budget,
                created_at: Utc::now(),
                model: model.clone(),
                process: None,
                launch_in_flight: true,
                teardown_in_flight: false,
            },
        );
        debug!("Reserved helper {} under {} ({})", identity, parent, budget);

        Ok(LaunchPlan {
            identity,
            parent,
            budget,
            peers,
            model,
        })
    }

    /// Result of a launch started by spawn or respawn. Returns a handle the
    /// caller must terminate when the hub began shutting down meanwhile.
    pub fn launch_finished(
        &mut self,
        id: HelperId,
        process: Option<ProcessHandle>,
    ) -> Result<Option<ProcessHandle>> {
        let shutting_down = self.shutting_down;
        let record = self.get_mut(id)?;
        record.launch_in_flight = false;
        match process {
            Some(handle) if shutting_down => {
                record.process = None;
                record.status = HelperStatus::Stopped;
                Ok(Some(handle))
            }
            Some(handle) => {
                record.process = Some(handle);
                Ok(None)
            }
            None => {
                record.process = None;
                record.status = HelperStatus::Stopped;
                Ok(None)
            }
        }
    }

    /// The process taken by [`Registry::begin_stop`] is gone
    pub fn teardown_finished(&mut self, id: HelperId) -> Result<()> {
        self.get_mut(id)?.teardown_in_flight = false;
        Ok(())
    }

    /// Returns true when the status changed
    pub fn register(&mut self, id: HelperId) -> Result<bool> {
        let record = match self.records.get_mut(&id) {
            Some(record) if record.status.is_live() => record,
            _ => return Err(BroodError::UnknownIdentity(id)),
        };
        match record.status {
            HelperStatus::Registered | HelperStatus::Running => Ok(false),
            _ => {
                record.status = HelperStatus::Registered;
                record.registered_at = Some(Utc::now());
                Ok(true)
            }
        }
    }

    /// Returns true when the status changed
    pub fn mark_running(&mut self, id: HelperId) -> Result<bool> {
        let record = self.get_mut(id)?;
        match record.status {
            HelperStatus::Running => Ok(false),
            HelperStatus::Registered => {
                record.status = HelperStatus::Running;
                Ok(true)
            }
            found => Err(BroodError::StateMismatch {
                identity: id,
                expected: "registered".to_string(),
                found,
            }),
        }
    }

    /// Make `conn` the subscriber for `id`, returning the one it replaces
    pub fn attach(&mut self, id: HelperId, conn: ConnId) -> Result<Option<ConnId>> {
        let record = self.get_mut(id)?;
        if id != DIRECTOR && !record.status.is_active() {
            return Err(BroodError::StateMismatch {
                identity: id,
                expected: "registered or running".to_string(),
                found: record.status,
            });
        }
        Ok(record.connection.replace(conn))
    }

    /// Drop `conn` as subscriber of `id`. Returns true if it was current and
    /// the helper has been marked stopped as a result.
    pub fn detach(&mut self, id: HelperId, conn: ConnId) -> bool {
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        if record.connection != Some(conn) {
            return false;
        }
        record.connection = None;
        if id != DIRECTOR && record.status.is_active() {
            record.status = HelperStatus::Stopped;
            return true;
        }
        false
    }

    pub fn begin_stop(&mut self, id: HelperId) -> Result<StopPlan> {
        if id == DIRECTOR {
            return Err(BroodError::InvalidRequest(
                "the director cannot be stopped through the hub".to_string(),
            ));
        }
        let record = self.get_mut(id)?;
        check_no_launch(record)?;
        match record.status {
            HelperStatus::Cleaned => Err(BroodError::StateMismatch {
                identity: id,
                expected: "not cleaned".to_string(),
                found: record.status,
            }),
            status => {
                record.status = HelperStatus::Stopped;
                let process = record.process.take();
                if process.is_some() {
                    record.teardown_in_flight = true;
                }
                Ok(StopPlan {
                    identity: id,
                    process,
                    connection: record.connection.take(),
                    already_stopped: status == HelperStatus::Stopped,
                })
            }
        }
    }

    pub fn begin_respawn(&mut self, id: HelperId) -> Result<LaunchPlan> {
        self.check_accepting()?;
        let peers = self.live_siblings(id);
        let record = self.get_mut(id)?;
        check_idle(record)?;
        if record.status != HelperStatus::Stopped {
            return Err(BroodError::StateMismatch {
                identity: id,
                expected: "stopped".to_string(),
                found: record.status,
            });
        }
        record.status = HelperStatus::Pending;
        record.launch_in_flight = true;

        Ok(LaunchPlan {
            identity: id,
            parent: record.parent.unwrap_or(DIRECTOR),
            budget: record.budget,
            peers,
            model: record.model.clone(),
        })
    }

    /// Mark `id` (and with `cascade`, its live descendants) cleaned.
    /// Steps come back deepest first, ending with `id`.
    pub fn begin_cleanup(&mut self, id: HelperId, cascade: bool) -> Result<Vec<CleanupStep>> {
        if id == DIRECTOR {
            return Err(BroodError::InvalidRequest(
                "the director cannot be cleaned up".to_string(),
            ));
        }
        let record = self.get(id)?;
        if record.status == HelperStatus::Cleaned {
            return Err(BroodError::StateMismatch {
                identity: id,
                expected: "not cleaned".to_string(),
                found: record.status,
            });
        }

        let descendants = self.live_descendants(id);
        if !descendants.is_empty() && !cascade {
            return Err(BroodError::HasDescendants {
                identity: id,
                children: self.live_children(id),
            });
        }

        let mut targets = descendants;
        targets.push(id);
        for target in &targets {
            check_idle(self.get(*target)?)?;
        }

        let mut steps = Vec::with_capacity(targets.len());
        for target in targets {
            let record = self.get_mut(target)?;
            record.status = HelperStatus::Cleaned;
            steps.push(CleanupStep {
                identity: target,
                process: record.process.take(),
                connection: record.connection.take(),
            });
        }
        Ok(steps)
    }

    /// Take every running process handle, marking its helper stopped.
    /// Launches still in flight hand their process back through
    /// [`Registry::launch_finished`]; no new ones are accepted.
    pub fn stop_all(&mut self) -> Vec<ProcessHandle> {
        self.shutting_down = true;
        let mut handles = Vec::new();
        for record in self.records.values_mut() {
            if record.identity == DIRECTOR || !record.status.is_live() {
                continue;
            }
            record.connection = None;
            if let Some(handle) = record.process.take() {
                handles.push(handle);
            }
            record.status = HelperStatus::Stopped;
        }
        handles
    }

    fn check_accepting(&self) -> Result<()> {
        if self.shutting_down {
            return Err(BroodError::HubUnavailable("hub is shutting down".to_string()));
        }
        Ok(())
    }

    pub fn summary(&self, id: HelperId) -> Result<HelperSummary> {
        Ok(self.get(id)?.summary())
    }

    /// Summaries of every helper that has not been cleaned
    pub fn summaries(&self) -> Vec<HelperSummary> {
        self.records
            .values()
            .filter(|r| r.status.is_live())
            .map(HelperRecord::summary)
            .collect()
    }
}

fn check_no_launch(record: &HelperRecord) -> Result<()> {
    if record.launch_in_flight {
        return Err(BroodError::StateMismatch {
            identity: record.identity,
            expected: "no launch in flight".to_string(),
            found: record.status,
        });
    }
    Ok(())
}

/// Neither a launch nor a stop is still working on the process
fn check_idle(record: &HelperRecord) -> Result<()> {
    check_no_launch(record)?;
    if record.teardown_in_flight {
        return Err(BroodError::StateMismatch {
            identity: record.identity,
            expected: "no stop in flight".to_string(),
            found: record.status,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(depth: u32, breadth: u32) -> Registry {
        Registry::new(Numbering::new(breadth).unwrap(), SpawnBudget::new(depth, breadth))
    }

    fn handle(id: HelperId) -> ProcessHandle {
        ProcessHandle {
            identity: id,
            name: format!("brood-helper-{}", id),
            id: format!("c{}", id),
        }
    }

    /// Spawn and complete the launch
    fn spawn(reg: &mut Registry, parent: HelperId) -> HelperId {
        let plan = reg.reserve_child(parent, None, None, None).unwrap();
        reg.launch_finished(plan.identity, Some(handle(plan.identity)))
            .unwrap();
        plan.identity
    }

    #[test]
    fn test_director_exists_and_runs() {
        let reg = registry(2, 3);
        let director = reg.get(DIRECTOR).unwrap();
        assert_eq!(director.status, HelperStatus::Running);
        assert_eq!(director.budget, SpawnBudget::new(2, 3));
    }

    #[test]
    fn test_spawn_uses_lowest_free_index() {
        let mut reg = registry(2, 3);
        assert_eq!(spawn(&mut reg, 0), 1);
        assert_eq!(spawn(&mut reg, 0), 2);
        reg.begin_cleanup(1, false).unwrap();

        let plan = reg.reserve_child(0, None, None, None).unwrap();
        assert_eq!(plan.identity, 1);
        assert_eq!(plan.peers, vec![2]);
    }

    #[test]
    fn test_breadth_bounds_live_children() {
        let mut reg = registry(2, 3);
        let child = spawn(&mut reg, 0);
        for _ in 0..3 {
            spawn(&mut reg, child);
        }
        let err = reg.reserve_child(child, None, None, None).unwrap_err();
        assert!(matches!(err, BroodError::TooManySiblings { parent: 1, .. }));
    }

    #[test]
    fn test_grandchild_of_depth_one_is_exhausted() {
        let mut reg = registry(1, 2);
        let child = spawn(&mut reg, 0);
        assert_eq!(reg.get(child).unwrap().budget.depth, 0);
        let err = reg.reserve_child(child, None, None, None).unwrap_err();
        assert!(matches!(err, BroodError::BudgetExhausted(1)));
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut reg = registry(2, 2);
        let id = spawn(&mut reg, 0);
        assert!(reg.register(id).unwrap());
        let first = reg.get(id).unwrap().registered_at;
        assert!(!reg.register(id).unwrap());
        assert_eq!(reg.get(id).unwrap().registered_at, first);
        assert_eq!(reg.get(id).unwrap().status, HelperStatus::Registered);

        assert!(matches!(
            reg.register(42),
            Err(BroodError::UnknownIdentity(42))
        ));
    }

    #[test]
    fn test_running_requires_registration() {
        let mut reg = registry(2, 2);
        let id = spawn(&mut reg, 0);
        assert!(matches!(
            reg.mark_running(id),
            Err(BroodError::StateMismatch { .. })
        ));
        reg.register(id).unwrap();
        assert!(reg.mark_running(id).unwrap());
        assert!(!reg.mark_running(id).unwrap());
    }

    #[test]
    fn test_attach_replaces_and_detach_stops() {
        let mut reg = registry(2, 2);
        let id = spawn(&mut reg, 0);
        assert!(reg.attach(id, 7).is_err());

        reg.register(id).unwrap();
        assert_eq!(reg.attach(id, 7).unwrap(), None);
        assert_eq!(reg.attach(id, 8).unwrap(), Some(7));

        // The replaced connection closing must not stop the helper
        assert!(!reg.detach(id, 7));
        assert_eq!(reg.get(id).unwrap().status, HelperStatus::Registered);

        assert!(reg.detach(id, 8));
        assert_eq!(reg.get(id).unwrap().status, HelperStatus::Stopped);
    }

    #[test]
    fn test_director_detach_keeps_running() {
        let mut reg = registry(2, 2);
        reg.attach(DIRECTOR, 1).unwrap();
        assert!(!reg.detach(DIRECTOR, 1));
        assert_eq!(reg.get(DIRECTOR).unwrap().status, HelperStatus::Running);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut reg = registry(2, 2);
        let id = spawn(&mut reg, 0);
        reg.register(id).unwrap();

        let plan = reg.begin_stop(id).unwrap();
        assert!(!plan.already_stopped);
        assert_eq!(plan.process, Some(handle(id)));

        let again = reg.begin_stop(id).unwrap();
        assert!(again.already_stopped);
        assert_eq!(again.process, None);
    }

    #[test]
    fn test_launch_in_flight_blocks_stop_and_cleanup() {
        let mut reg = registry(2, 2);
        let plan = reg.reserve_child(0, None, None, None).unwrap();
        assert!(matches!(
            reg.begin_stop(plan.identity),
            Err(BroodError::StateMismatch { .. })
        ));
        assert!(matches!(
            reg.begin_cleanup(plan.identity, true),
            Err(BroodError::StateMismatch { .. })
        ));

        reg.launch_finished(plan.identity, None).unwrap();
        assert_eq!(
            reg.get(plan.identity).unwrap().status,
            HelperStatus::Stopped
        );
        assert!(reg.begin_respawn(plan.identity).is_ok());
    }

    #[test]
    fn test_respawn_only_from_stopped() {
        let mut reg = registry(2, 2);
        let id = spawn(&mut reg, 0);
        reg.register(id).unwrap();
        assert!(matches!(
            reg.begin_respawn(id),
            Err(BroodError::StateMismatch { .. })
        ));

        reg.begin_stop(id).unwrap();
        reg.teardown_finished(id).unwrap();
        let plan = reg.begin_respawn(id).unwrap();
        assert_eq!(plan.identity, id);
        assert_eq!(plan.budget, reg.get(id).unwrap().budget);
        assert_eq!(reg.get(id).unwrap().status, HelperStatus::Pending);
    }

    #[test]
    fn test_cleanup_requires_cascade_for_descendants() {
        let mut reg = registry(3, 2);
        let one = spawn(&mut reg, 0);
        let child = spawn(&mut reg, one);
        let grandchild = spawn(&mut reg, child);

        let err = reg.begin_cleanup(one, false).unwrap_err();
        assert!(matches!(err, BroodError::HasDescendants { identity: 1, ref children } if children == &vec![child]));

        let steps = reg.begin_cleanup(one, true).unwrap();
        let order: Vec<HelperId> = steps.iter().map(|s| s.identity).collect();
        assert_eq!(order, vec![grandchild, child, one]);
        assert!(reg.summaries().iter().all(|s| s.identity == DIRECTOR));

        // Tombstones answer racing commands with a state mismatch
        assert!(matches!(
            reg.begin_cleanup(one, true),
            Err(BroodError::StateMismatch { .. })
        ));
        assert!(matches!(
            reg.begin_stop(child),
            Err(BroodError::StateMismatch { .. })
        ));
        assert!(matches!(
            reg.begin_respawn(grandchild),
            Err(BroodError::StateMismatch { .. })
        ));
    }

    #[test]
    fn test_stop_in_flight_blocks_respawn_and_cleanup() {
        let mut reg = registry(2, 2);
        let id = spawn(&mut reg, 0);
        reg.register(id).unwrap();

        let plan = reg.begin_stop(id).unwrap();
        assert!(plan.process.is_some());
        assert!(matches!(
            reg.begin_respawn(id),
            Err(BroodError::StateMismatch { .. })
        ));
        assert!(matches!(
            reg.begin_cleanup(id, false),
            Err(BroodError::StateMismatch { .. })
        ));
        // Repeating the stop is still fine
        assert!(reg.begin_stop(id).unwrap().already_stopped);

        reg.teardown_finished(id).unwrap();
        assert!(reg.begin_respawn(id).is_ok());
    }

    #[test]
    fn test_launch_finishing_after_shutdown_returns_handle() {
        let mut reg = registry(2, 2);
        let running = spawn(&mut reg, 0);
        let plan = reg.reserve_child(0, None, None, None).unwrap();

        let handles = reg.stop_all();
        assert_eq!(handles, vec![handle(running)]);

        let orphan = reg
            .launch_finished(plan.identity, Some(handle(plan.identity)))
            .unwrap();
        assert_eq!(orphan, Some(handle(plan.identity)));
        let record = reg.get(plan.identity).unwrap();
        assert_eq!(record.status, HelperStatus::Stopped);
        assert!(record.process.is_none());

        assert!(matches!(
            reg.reserve_child(0, None, None, None),
            Err(BroodError::HubUnavailable(_))
        ));
    }

    #[test]
    fn test_director_cannot_be_cleaned() {
        let mut reg = registry(2, 2);
        assert!(matches!(
            reg.begin_cleanup(DIRECTOR, true),
            Err(BroodError::InvalidRequest(_))
        ));
    }
}
