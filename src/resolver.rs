//! AgentResolver (spec §4.8): `extension -> AgentHandle` and
//! `agent_id -> AgentHandle` caches backed by the persistent store, with
//! placeholder-agent creation on a cold miss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::domain::Agent;
use crate::persist::Store;

#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub agent_id: u64,
    pub extension: String,
    pub display_name: String,
    /// `true` for a handle minted on a store failure; never cached, so the
    /// next lookup retries against the store instead of sticking with a
    /// value that might be stale (spec §4.8).
    pub transient: bool,
}

#[derive(Debug, Default)]
pub struct ResolverStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub placeholders_created: AtomicU64,
}

pub struct AgentResolver<'s> {
    store: &'s Store,
    by_extension: Mutex<HashMap<String, AgentHandle>>,
    by_agent_id: Mutex<HashMap<u64, AgentHandle>>,
    stats: ResolverStats,
}

impl<'s> AgentResolver<'s> {
    /// Load all active agents and secondary extension mappings from the
    /// store (spec §4.8 "On initialize").
    pub fn new(store: &'s Store) -> crate::error::Result<Self> {
        let resolver = Self {
            store,
            by_extension: Mutex::new(HashMap::new()),
            by_agent_id: Mutex::new(HashMap::new()),
            stats: ResolverStats::default(),
        };
        resolver.reload()?;
        Ok(resolver)
    }

    pub fn reload(&self) -> crate::error::Result<()> {
        let agents = self.store.load_active_agents()?;
        let mut by_ext = self.by_extension.lock().unwrap();
        let mut by_id = self.by_agent_id.lock().unwrap();
        by_ext.clear();
        by_id.clear();
        for agent in agents {
            let handle = AgentHandle {
                agent_id: agent.id,
                extension: agent.extension.clone(),
                display_name: agent.display_name.clone(),
                transient: false,
            };
            by_ext.insert(agent.extension.clone(), handle.clone());
            by_id.insert(agent.id, handle);
        }
        Ok(())
    }

    pub fn stats(&self) -> &ResolverStats {
        &self.stats
    }

    /// Resolve an extension to an agent handle, creating a placeholder on a
    /// cold miss (spec §4.8).
    pub fn resolve(&self, extension: &str, now: i64) -> AgentHandle {
        if let Some(handle) = self.by_extension.lock().unwrap().get(extension).cloned() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return handle;
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        match self.store.find_agent_by_extension(extension) {
            Ok(Some(agent)) => {
                let handle = AgentHandle {
                    agent_id: agent.id,
                    extension: agent.extension.clone(),
                    display_name: agent.display_name.clone(),
                    transient: false,
                };
                self.by_extension
                    .lock()
                    .unwrap()
                    .insert(extension.to_string(), handle.clone());
                self.by_agent_id
                    .lock()
                    .unwrap()
                    .insert(handle.agent_id, handle.clone());
                handle
            }
            Ok(None) => match self.create_placeholder(extension, now) {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(extension, error = %e, "failed to persist placeholder agent");
                    AgentHandle {
                        agent_id: 0,
                        extension: extension.to_string(),
                        display_name: format!("placeholder-{extension}"),
                        transient: true,
                    }
                }
            },
            Err(e) => {
                tracing::warn!(extension, error = %e, "agent lookup failed");
                AgentHandle {
                    agent_id: 0,
                    extension: extension.to_string(),
                    display_name: format!("placeholder-{extension}"),
                    transient: true,
                }
            }
        }
    }

    pub fn resolve_by_id(&self, agent_id: u64) -> Option<AgentHandle> {
        self.by_agent_id.lock().unwrap().get(&agent_id).cloned()
    }

    fn create_placeholder(&self, extension: &str, now: i64) -> crate::error::Result<AgentHandle> {
        let placeholder_id = self.store.next_agent_id()?;
        let agent = Agent::placeholder(placeholder_id, extension, now);
        self.store.upsert_agent(&agent)?;
        self.stats.placeholders_created.fetch_add(1, Ordering::Relaxed);

        let handle = AgentHandle {
            agent_id: agent.id,
            extension: extension.to_string(),
            display_name: agent.display_name,
            transient: false,
        };
        self.by_extension
            .lock()
            .unwrap()
            .insert(extension.to_string(), handle.clone());
        self.by_agent_id
            .lock()
            .unwrap()
            .insert(handle.agent_id, handle.clone());
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn resolve_creates_placeholder_on_miss() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let resolver = AgentResolver::new(&store).unwrap();

        let handle = resolver.resolve("2099", 1_000);
        assert!(!handle.transient);
        assert_eq!(handle.display_name, "Extension 2099");
        assert_eq!(resolver.stats().placeholders_created.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn resolve_is_cached_after_first_lookup() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let resolver = AgentResolver::new(&store).unwrap();

        let first = resolver.resolve("2099", 1_000);
        let second = resolver.resolve("2099", 2_000);
        assert_eq!(first.agent_id, second.agent_id);
        assert_eq!(resolver.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(resolver.stats().misses.load(Ordering::Relaxed), 1);
    }
}
