//! StateStore: redb-backed state persistence for SignalGrid.
//!
//! Holds intersection configs, the current signal state of each
//! intersection and its evaluation lease. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! redb serializes write transactions, so every read-check-write sequence
//! below (compare-and-swap, lease acquisition, provisioning) runs inside a
//! single write transaction and is atomic per database.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use signal_core::{IntersectionId, IntersectionSpec};

use crate::access::{LeaseStore, SignalStore};
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INTERSECTIONS).map_err(map_err!(Table))?;
        txn.open_table(SIGNALS).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_value<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list_values<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    // ── Intersections ──────────────────────────────────────────────

    /// Store an intersection config and make sure it has a signal state.
    ///
    /// A new intersection starts in its first phase at `now_ms`. An existing
    /// state is kept as long as its phase still exists under the new config;
    /// otherwise it restarts the cycle with the version bumped.
    pub fn provision(&self, spec: &IntersectionSpec, now_ms: u64) -> StateResult<SignalState> {
        if spec.phases.is_empty() {
            return Err(StateError::InvalidTransition {
                intersection: spec.id.clone(),
                reason: "cannot provision an intersection without phases".to_string(),
            });
        }
        let spec_value = encode(spec)?;
        let key = spec.id.as_str();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (state, reset) = {
            let mut configs = txn.open_table(INTERSECTIONS).map_err(map_err!(Table))?;
            configs
                .insert(key, spec_value.as_slice())
                .map_err(map_err!(Write))?;

            let mut signals = txn.open_table(SIGNALS).map_err(map_err!(Table))?;
            let existing: Option<SignalState> = match signals.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };

            match existing {
                Some(current) if current.matches(spec) => (current, false),
                existing => {
                    let mut fresh = SignalState::initial(spec, now_ms);
                    if let Some(old) = existing {
                        fresh.phase_started_at_ms = now_ms.max(old.phase_started_at_ms);
                        fresh.planned_at_ms = fresh.phase_started_at_ms;
                        fresh.version = old.version + 1;
                    }
                    let value = encode(&fresh)?;
                    signals
                        .insert(key, value.as_slice())
                        .map_err(map_err!(Write))?;
                    (fresh, true)
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;

        info!(
            intersection = %key,
            phase = %state.phase,
            version = state.version,
            reset,
            "intersection provisioned"
        );
        Ok(state)
    }

    pub fn get_intersection(&self, id: &str) -> StateResult<Option<IntersectionSpec>> {
        self.get_value(INTERSECTIONS, id)
    }

    pub fn list_intersections(&self) -> StateResult<Vec<IntersectionSpec>> {
        self.list_values(INTERSECTIONS)
    }

    /// Remove an intersection with its state and lease. Returns true if it existed.
    pub fn remove_intersection(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut configs = txn.open_table(INTERSECTIONS).map_err(map_err!(Table))?;
            existed = configs.remove(id).map_err(map_err!(Write))?.is_some();
            let mut signals = txn.open_table(SIGNALS).map_err(map_err!(Table))?;
            signals.remove(id).map_err(map_err!(Write))?;
            let mut leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
            leases.remove(id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(intersection = %id, existed, "intersection removed");
        Ok(existed)
    }

    // ── Signal state ───────────────────────────────────────────────

    pub fn get_signal(&self, id: &str) -> StateResult<Option<SignalState>> {
        self.get_value(SIGNALS, id)
    }

    pub fn list_signals(&self) -> StateResult<Vec<SignalState>> {
        self.list_values(SIGNALS)
    }

    /// Write `new_state` if the stored version equals `expected_version`.
    ///
    /// `new_state` must carry `expected_version + 1`, belong to `id` and not
    /// move the phase start backwards; violations are errors rather than a
    /// failed swap, since they indicate a broken caller.
    pub fn swap_signal(
        &self,
        id: &str,
        expected_version: u64,
        new_state: &SignalState,
    ) -> StateResult<bool> {
        let invalid = |reason: String| StateError::InvalidTransition {
            intersection: id.to_string(),
            reason,
        };
        if new_state.intersection_id != id {
            return Err(invalid(format!(
                "state belongs to {}",
                new_state.intersection_id
            )));
        }
        if new_state.version != expected_version + 1 {
            return Err(invalid(format!(
                "version {} does not follow {expected_version}",
                new_state.version
            )));
        }
        let value = encode(new_state)?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let swapped = {
            let mut table = txn.open_table(SIGNALS).map_err(map_err!(Table))?;
            let current: Option<SignalState> = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match current {
                Some(current) if current.version == expected_version => {
                    if new_state.phase_started_at_ms < current.phase_started_at_ms {
                        return Err(invalid("phase start moved backwards".to_string()));
                    }
                    table
                        .insert(id, value.as_slice())
                        .map_err(map_err!(Write))?;
                    true
                }
                _ => false,
            }
        };

        if swapped {
            txn.commit().map_err(map_err!(Transaction))?;
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        debug!(intersection = %id, expected_version, swapped, "signal compare-and-swap");
        Ok(swapped)
    }

    // ── Leases ─────────────────────────────────────────────────────

    pub fn get_lease(&self, id: &str) -> StateResult<Option<EvaluationLease>> {
        self.get_value(LEASES, id)
    }

    pub fn list_leases(&self) -> StateResult<Vec<EvaluationLease>> {
        self.list_values(LEASES)
    }

    /// Acquire the lease for `id` unless another holder has a live one.
    /// Re-acquiring by the current holder extends the expiry.
    pub fn acquire_lease(
        &self,
        id: &str,
        holder: &str,
        ttl: Duration,
        now_ms: u64,
    ) -> StateResult<bool> {
        let lease = EvaluationLease::new(id, holder, ttl, now_ms);
        let value = encode(&lease)?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let acquired = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let existing: Option<EvaluationLease> = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let blocked = existing.is_some_and(|l| l.is_live(now_ms) && l.holder != holder);
            if !blocked {
                table
                    .insert(id, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            !blocked
        };

        if acquired {
            txn.commit().map_err(map_err!(Transaction))?;
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(acquired)
    }

    /// Remove the lease for `id` if `holder` owns it. Returns true if removed.
    pub fn release_lease(&self, id: &str, holder: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let owned = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => decode::<EvaluationLease>(guard.value())?.holder == holder,
                None => false,
            };
            if owned {
                table.remove(id).map_err(map_err!(Write))?;
            }
            owned
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }

    /// Delete expired leases. Returns the number removed.
    pub fn purge_expired_leases(&self, now_ms: u64) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let mut expired = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let lease: EvaluationLease = decode(value.value())?;
                if !lease.is_live(now_ms) {
                    expired.push(key.value().to_string());
                }
            }
            for key in &expired {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            expired.len() as u32
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if count > 0 {
            debug!(count, "expired leases purged");
        }
        Ok(count)
    }
}

impl SignalStore for StateStore {
    fn intersection(&self, id: &str) -> StateResult<Option<IntersectionSpec>> {
        self.get_intersection(id)
    }

    fn intersection_ids(&self) -> StateResult<Vec<IntersectionId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INTERSECTIONS).map_err(map_err!(Table))?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }

    fn read(&self, id: &str) -> StateResult<Option<SignalState>> {
        self.get_signal(id)
    }

    fn compare_and_swap(
        &self,
        id: &str,
        expected_version: u64,
        new_state: &SignalState,
    ) -> StateResult<bool> {
        self.swap_signal(id, expected_version, new_state)
    }
}

impl LeaseStore for StateStore {
    fn try_acquire(
        &self,
        id: &str,
        holder: &str,
        ttl: Duration,
        now_ms: u64,
    ) -> StateResult<bool> {
        self.acquire_lease(id, holder, ttl, now_ms)
    }

    fn release(&self, id: &str, holder: &str) -> StateResult<()> {
        self.release_lease(id, holder).map(|_| ())
    }

    fn purge_expired(&self, now_ms: u64) -> StateResult<u32> {
        self.purge_expired_leases(now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_core::{Approach, PhasePlan, PhaseSpec, PlanKind, PolicyKind};

    fn phase(name: &str) -> PhaseSpec {
        PhaseSpec {
            name: name.to_string(),
            approaches: vec![Approach::North, Approach::South],
            min_duration: Duration::from_secs(10),
            max_duration: Duration::from_secs(60),
            base_duration: Duration::from_secs(30),
        }
    }

    fn test_spec(id: &str, phases: &[&str]) -> IntersectionSpec {
        IntersectionSpec {
            id: id.to_string(),
            name: id.to_string(),
            phases: phases.iter().map(|p| phase(p)).collect(),
            density_weight: 1.0,
            staleness_threshold: Duration::from_secs(30),
            saturation_count: 40.0,
            lease_ttl: Duration::from_secs(10),
            evaluation_timeout: Duration::from_secs(5),
            observe_timeout: Duration::from_secs(2),
            policy: PolicyKind::Linear,
        }
    }

    fn advance(state: &SignalState, spec: &IntersectionSpec, now_ms: u64) -> SignalState {
        let plan = PhasePlan {
            kind: PlanKind::Advance,
            phase_index: spec.next_phase_index(state.phase_index),
            duration: Duration::from_secs(30),
            density: None,
        };
        state.successor(spec, &plan, now_ms)
    }

    // ── Provisioning ───────────────────────────────────────────────

    #[test]
    fn provision_creates_initial_state() {
        let store = StateStore::open_in_memory().unwrap();
        let spec = test_spec("x1", &["A", "B"]);

        let state = store.provision(&spec, 1_000).unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.phase, "A");

        assert_eq!(store.get_intersection("x1").unwrap(), Some(spec));
        assert_eq!(store.get_signal("x1").unwrap(), Some(state));
    }

    #[test]
    fn reprovision_keeps_compatible_state() {
        let store = StateStore::open_in_memory().unwrap();
        let spec = test_spec("x1", &["A", "B"]);
        let initial = store.provision(&spec, 1_000).unwrap();
        let moved = advance(&initial, &spec, 40_000);
        assert!(store.swap_signal("x1", 1, &moved).unwrap());

        let mut updated = spec.clone();
        updated.density_weight = 2.0;
        let state = store.provision(&updated, 50_000).unwrap();
        assert_eq!(state, moved);
        assert_eq!(store.get_intersection("x1").unwrap().unwrap().density_weight, 2.0);
    }

    #[test]
    fn reprovision_resets_state_when_phase_disappears() {
        let store = StateStore::open_in_memory().unwrap();
        let spec = test_spec("x1", &["A", "B"]);
        let initial = store.provision(&spec, 1_000).unwrap();
        assert!(store.swap_signal("x1", 1, &advance(&initial, &spec, 40_000)).unwrap());

        let state = store.provision(&test_spec("x1", &["A", "C"]), 50_000).unwrap();
        assert_eq!(state.phase, "A");
        assert_eq!(state.version, 3);
        assert_eq!(state.phase_started_at_ms, 50_000);
    }

    #[test]
    fn provision_rejects_empty_phase_list() {
        let store = StateStore::open_in_memory().unwrap();
        let result = store.provision(&test_spec("x1", &[]), 1_000);
        assert!(matches!(result, Err(StateError::InvalidTransition { .. })));
        assert!(store.get_intersection("x1").unwrap().is_none());
    }

    #[test]
    fn intersection_ids_and_removal() {
        let store = StateStore::open_in_memory().unwrap();
        store.provision(&test_spec("x1", &["A"]), 1_000).unwrap();
        store.provision(&test_spec("x2", &["A"]), 1_000).unwrap();
        assert!(store.acquire_lease("x1", "h", Duration::from_secs(5), 1_000).unwrap());

        let mut ids = store.intersection_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["x1".to_string(), "x2".to_string()]);

        assert!(store.remove_intersection("x1").unwrap());
        assert!(!store.remove_intersection("x1").unwrap());
        assert!(store.get_signal("x1").unwrap().is_none());
        assert!(store.get_lease("x1").unwrap().is_none());
        assert_eq!(store.list_intersections().unwrap().len(), 1);
    }

    // ── Compare-and-swap ───────────────────────────────────────────

    #[test]
    fn swap_with_current_version_succeeds() {
        let store = StateStore::open_in_memory().unwrap();
        let spec = test_spec("x1", &["A", "B"]);
        let initial = store.provision(&spec, 1_000).unwrap();

        let next = advance(&initial, &spec, 31_000);
        assert!(store.compare_and_swap("x1", 1, &next).unwrap());

        let stored = store.read("x1").unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.phase, "B");
    }

    #[test]
    fn swap_with_stale_version_is_rejected_without_writing() {
        let store = StateStore::open_in_memory().unwrap();
        let spec = test_spec("x1", &["A", "B"]);
        let initial = store.provision(&spec, 1_000).unwrap();

        let first = advance(&initial, &spec, 31_000);
        let second = advance(&initial, &spec, 31_500);
        assert!(store.compare_and_swap("x1", 1, &first).unwrap());
        assert!(!store.compare_and_swap("x1", 1, &second).unwrap());

        assert_eq!(store.read("x1").unwrap(), Some(first));
    }

    #[test]
    fn swap_on_missing_state_returns_false() {
        let store = StateStore::open_in_memory().unwrap();
        let spec = test_spec("x1", &["A", "B"]);
        let state = SignalState::initial(&spec, 1_000);
        let next = advance(&state, &spec, 31_000);
        assert!(!store.compare_and_swap("x1", 1, &next).unwrap());
    }

    #[test]
    fn swap_rejects_version_gap() {
        let store = StateStore::open_in_memory().unwrap();
        let spec = test_spec("x1", &["A", "B"]);
        let initial = store.provision(&spec, 1_000).unwrap();

        let mut next = advance(&initial, &spec, 31_000);
        next.version = 5;
        let result = store.compare_and_swap("x1", 1, &next);
        assert!(matches!(result, Err(StateError::InvalidTransition { .. })));
    }

    #[test]
    fn swap_rejects_backwards_phase_start() {
        let store = StateStore::open_in_memory().unwrap();
        let spec = test_spec("x1", &["A", "B"]);
        let initial = store.provision(&spec, 10_000).unwrap();

        let mut next = advance(&initial, &spec, 40_000);
        next.phase_started_at_ms = 5_000;
        let result = store.compare_and_swap("x1", 1, &next);
        assert!(matches!(result, Err(StateError::InvalidTransition { .. })));
        assert_eq!(store.read("x1").unwrap(), Some(initial));
    }

    #[test]
    fn swap_rejects_foreign_state() {
        let store = StateStore::open_in_memory().unwrap();
        let spec = test_spec("x1", &["A", "B"]);
        let initial = store.provision(&spec, 1_000).unwrap();
        let next = advance(&initial, &spec, 31_000);
        let result = store.compare_and_swap("x2", 1, &next);
        assert!(matches!(result, Err(StateError::InvalidTransition { .. })));
    }

    // ── Leases ─────────────────────────────────────────────────────

    #[test]
    fn lease_is_exclusive_until_expiry() {
        let store = StateStore::open_in_memory().unwrap();
        let ttl = Duration::from_secs(5);

        assert!(store.try_acquire("x1", "h1", ttl, 1_000).unwrap());
        assert!(!store.try_acquire("x1", "h2", ttl, 2_000).unwrap());
        // Expired at 6_000.
        assert!(store.try_acquire("x1", "h2", ttl, 6_000).unwrap());
        assert_eq!(store.get_lease("x1").unwrap().unwrap().holder, "h2");
    }

    #[test]
    fn lease_holder_can_reacquire() {
        let store = StateStore::open_in_memory().unwrap();
        let ttl = Duration::from_secs(5);
        assert!(store.try_acquire("x1", "h1", ttl, 1_000).unwrap());
        assert!(store.try_acquire("x1", "h1", ttl, 3_000).unwrap());
        assert_eq!(store.get_lease("x1").unwrap().unwrap().expires_at_ms, 8_000);
    }

    #[test]
    fn leases_are_independent_per_intersection() {
        let store = StateStore::open_in_memory().unwrap();
        let ttl = Duration::from_secs(5);
        assert!(store.try_acquire("x1", "h1", ttl, 1_000).unwrap());
        assert!(store.try_acquire("x2", "h2", ttl, 1_000).unwrap());
    }

    #[test]
    fn release_only_by_holder_and_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let ttl = Duration::from_secs(5);
        assert!(store.try_acquire("x1", "h1", ttl, 1_000).unwrap());

        assert!(!store.release_lease("x1", "h2").unwrap());
        assert!(store.get_lease("x1").unwrap().is_some());

        assert!(store.release_lease("x1", "h1").unwrap());
        assert!(!store.release_lease("x1", "h1").unwrap());
        store.release("x1", "h1").unwrap();
        assert!(store.try_acquire("x1", "h2", ttl, 1_500).unwrap());
    }

    #[test]
    fn purge_removes_only_expired_leases() {
        let store = StateStore::open_in_memory().unwrap();
        store.try_acquire("x1", "h1", Duration::from_secs(1), 1_000).unwrap();
        store.try_acquire("x2", "h2", Duration::from_secs(60), 1_000).unwrap();

        assert_eq!(store.purge_expired(5_000).unwrap(), 1);
        let leases = store.list_leases().unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].intersection_id, "x2");
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("signals.redb");
        let spec = test_spec("x1", &["A", "B"]);

        {
            let store = StateStore::open(&db_path).unwrap();
            let initial = store.provision(&spec, 1_000).unwrap();
            assert!(store.swap_signal("x1", 1, &advance(&initial, &spec, 31_000)).unwrap());
        }

        let store = StateStore::open(&db_path).unwrap();
        let state = store.get_signal("x1").unwrap().unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(state.phase, "B");
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_intersections().unwrap().is_empty());
        assert!(store.list_signals().unwrap().is_empty());
        assert!(store.intersection_ids().unwrap().is_empty());
        assert!(store.read("nope").unwrap().is_none());
        assert_eq!(store.purge_expired(u64::MAX).unwrap(), 0);
        store.release("nope", "h").unwrap();
    }
}
