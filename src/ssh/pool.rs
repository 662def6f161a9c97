//! Per-`host:port` connection pools.
//!
//! The pool registry is guarded by a reader-writer lock (most accesses
//! are "find the pool for this host" reads); each individual pool has
//! its own mutex protecting the active set and idle queue, a two-tier
//! locking model so a single slow host never blocks lookups for
//! others.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use uuid::Uuid;

use super::Connection;

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub active_conns: usize,
    pub available_conns: usize,
    pub total_conns: usize,
    pub created: u64,
    pub failed: u64,
    pub commands_executed: u64,
}

pub(super) struct Pool {
    idle: VecDeque<Connection>,
    active: HashSet<Uuid>,
    max_connections: usize,
    created: u64,
    failed: u64,
    commands_executed: u64,
}

impl Pool {
    fn new(max_connections: usize) -> Self {
        Pool {
            idle: VecDeque::new(),
            active: HashSet::new(),
            max_connections,
            created: 0,
            failed: 0,
            commands_executed: 0,
        }
    }

    /// Pops the front idle connection, discarding it (and signalling so
    /// via the `bool`) if it has outlived `ttl`.
    fn take_idle(&mut self, ttl: Duration) -> Option<Connection> {
        while let Some(conn) = self.idle.pop_front() {
            if conn.age() > ttl {
                continue;
            }
            return Some(conn);
        }
        None
    }

    fn mark_active(&mut self, id: Uuid) {
        self.active.insert(id);
    }

    fn mark_idle(&mut self, conn: Connection) {
        self.active.remove(&conn.id);
        self.idle.push_back(conn);
    }

    fn remove_active(&mut self, id: &Uuid) {
        self.active.remove(id);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            active_conns: self.active.len(),
            available_conns: self.idle.len(),
            total_conns: self.active.len() + self.idle.len(),
            created: self.created,
            failed: self.failed,
            commands_executed: self.commands_executed,
        }
    }

    fn drain(&mut self) -> Vec<Connection> {
        self.active.clear();
        self.idle.drain(..).collect()
    }
}

pub(super) struct Registry {
    pools: RwLock<HashMap<String, Mutex<Pool>>>,
}

impl Registry {
    pub(super) fn new() -> Self {
        Registry {
            pools: RwLock::new(HashMap::new()),
        }
    }

    fn ensure_pool(&self, host_id: &str, max_connections: usize) {
        {
            let pools = self.pools.read().expect("pool registry lock poisoned");
            if pools.contains_key(host_id) {
                return;
            }
        }
        let mut pools = self.pools.write().expect("pool registry lock poisoned");
        pools
            .entry(host_id.to_string())
            .or_insert_with(|| Mutex::new(Pool::new(max_connections)));
    }

    /// Attempts to reuse an idle connection for `host_id`, discarding
    /// any that have exceeded `ttl`. Returns `None` when a fresh
    /// connection must be created.
    pub(super) fn take_idle(
        &self,
        host_id: &str,
        max_connections: usize,
        ttl: Duration,
    ) -> Option<Connection> {
        self.ensure_pool(host_id, max_connections);
        let pools = self.pools.read().expect("pool registry lock poisoned");
        let mut pool = pools
            .get(host_id)
            .expect("pool just ensured")
            .lock()
            .expect("pool mutex poisoned");
        let conn = pool.take_idle(ttl);
        if let Some(ref c) = conn {
            pool.mark_active(c.id);
        }
        conn
    }

    pub(super) fn is_at_capacity(&self, host_id: &str, max_connections: usize) -> bool {
        self.ensure_pool(host_id, max_connections);
        let pools = self.pools.read().expect("pool registry lock poisoned");
        let pool = pools
            .get(host_id)
            .expect("pool just ensured")
            .lock()
            .expect("pool mutex poisoned");
        pool.active.len() + pool.idle.len() >= pool.max_connections
    }

    pub(super) fn register_new(&self, host_id: &str, max_connections: usize, conn: &Connection) {
        self.ensure_pool(host_id, max_connections);
        let pools = self.pools.read().expect("pool registry lock poisoned");
        let mut pool = pools
            .get(host_id)
            .expect("pool just ensured")
            .lock()
            .expect("pool mutex poisoned");
        pool.created += 1;
        pool.mark_active(conn.id);
    }

    pub(super) fn record_failure(&self, host_id: &str, max_connections: usize) {
        self.ensure_pool(host_id, max_connections);
        let pools = self.pools.read().expect("pool registry lock poisoned");
        let mut pool = pools
            .get(host_id)
            .expect("pool just ensured")
            .lock()
            .expect("pool mutex poisoned");
        pool.failed += 1;
    }

    pub(super) fn record_command(&self, host_id: &str, max_connections: usize) {
        self.ensure_pool(host_id, max_connections);
        let pools = self.pools.read().expect("pool registry lock poisoned");
        let mut pool = pools
            .get(host_id)
            .expect("pool just ensured")
            .lock()
            .expect("pool mutex poisoned");
        pool.commands_executed += 1;
    }

    /// Returns a connection to the idle queue.
    pub(super) fn release(&self, host_id: &str, max_connections: usize, conn: Connection) {
        self.ensure_pool(host_id, max_connections);
        let pools = self.pools.read().expect("pool registry lock poisoned");
        let mut pool = pools
            .get(host_id)
            .expect("pool just ensured")
            .lock()
            .expect("pool mutex poisoned");
        pool.mark_idle(conn);
    }

    pub(super) fn forget_active(&self, host_id: &str, id: &Uuid) {
        let pools = self.pools.read().expect("pool registry lock poisoned");
        if let Some(pool) = pools.get(host_id) {
            pool.lock().expect("pool mutex poisoned").remove_active(id);
        }
    }

    pub(super) fn stats(&self) -> HashMap<String, PoolStats> {
        let pools = self.pools.read().expect("pool registry lock poisoned");
        pools
            .iter()
            .map(|(host, pool)| (host.clone(), pool.lock().expect("pool mutex poisoned").stats()))
            .collect()
    }

    /// Drains every pool, returning every connection they held so the
    /// caller can close them, and empties the registry.
    pub(super) fn drain_all(&self) -> Vec<Connection> {
        let mut pools = self.pools.write().expect("pool registry lock poisoned");
        let drained: Vec<Connection> = pools
            .values()
            .flat_map(|pool| pool.lock().expect("pool mutex poisoned").drain())
            .collect();
        pools.clear();
        drained
    }
}

pub(super) fn host_id(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}
