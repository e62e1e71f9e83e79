//! Seed registry: immutable seed → store mapping, swapped as a whole on topology change.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use seedling_core::Result;
use seedling_store::ResourceStore;
use tracing::{debug, info};

/// Seed name → connection identity (e.g. kubeconfig Secret and its revision).
pub type SeedTopology = BTreeMap<String, String>;

#[derive(Clone)]
struct SeedEntry {
    identity: String,
    store: Arc<dyn ResourceStore>,
}

#[derive(Clone, Default)]
pub struct SeedRegistry {
    seeds: BTreeMap<String, SeedEntry>,
}

impl SeedRegistry {
    pub fn new() -> Self { Self::default() }

    /// Add a seed with an empty identity.
    pub fn with_seed(self, name: impl Into<String>, store: Arc<dyn ResourceStore>) -> Self {
        self.with_identified_seed(name, String::new(), store)
    }

    pub fn with_identified_seed(mut self, name: impl Into<String>, identity: impl Into<String>, store: Arc<dyn ResourceStore>) -> Self {
        self.seeds.insert(name.into(), SeedEntry { identity: identity.into(), store });
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ResourceStore>> { self.seeds.get(name).map(|e| &e.store) }

    pub fn identity(&self, name: &str) -> Option<&str> { self.seeds.get(name).map(|e| e.identity.as_str()) }

    pub fn topology(&self) -> SeedTopology {
        self.seeds.iter().map(|(n, e)| (n.clone(), e.identity.clone())).collect()
    }

    pub fn contains(&self, name: &str) -> bool { self.seeds.contains_key(name) }

    /// Seeds in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ResourceStore>)> {
        self.seeds.iter().map(|(k, e)| (k.as_str(), &e.store))
    }

    pub fn names(&self) -> Vec<String> { self.seeds.keys().cloned().collect() }

    pub fn len(&self) -> usize { self.seeds.len() }

    pub fn is_empty(&self) -> bool { self.seeds.is_empty() }
}

impl FromIterator<(String, Arc<dyn ResourceStore>)> for SeedRegistry {
    fn from_iter<I: IntoIterator<Item = (String, Arc<dyn ResourceStore>)>>(iter: I) -> Self {
        iter.into_iter().fold(Self::new(), |reg, (name, store)| reg.with_seed(name, store))
    }
}

/// Shared pointer to the current registry. Reconciles take a snapshot and
/// keep using it even if the topology changes underneath them.
#[derive(Clone)]
pub struct RegistryHandle {
    current: Arc<ArcSwap<SeedRegistry>>,
}

impl RegistryHandle {
    pub fn new(registry: SeedRegistry) -> Self { Self { current: Arc::new(ArcSwap::from_pointee(registry)) } }

    pub fn snapshot(&self) -> Arc<SeedRegistry> { self.current.load_full() }

    pub fn replace(&self, next: SeedRegistry) {
        {
            let prev = self.current.load();
            let added: Vec<&str> = next.iter().map(|(n, _)| n).filter(|n| !prev.contains(n)).collect();
            let removed: Vec<&str> = prev.iter().map(|(n, _)| n).filter(|n| !next.contains(n)).collect();
            info!(seeds = next.len(), added = ?added, removed = ?removed, "registry: topology changed");
        }
        self.current.store(Arc::new(next));
    }

    /// Converge the registry on `desired`. Seeds whose identity is unchanged
    /// keep their store; `connect` is called only for new or changed seeds.
    /// Returns whether the registry was swapped.
    pub async fn sync_topology<F, Fut>(&self, desired: &SeedTopology, mut connect: F) -> Result<bool>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<Arc<dyn ResourceStore>>>,
    {
        let current = self.snapshot();
        if current.topology() == *desired {
            debug!(seeds = desired.len(), "registry: topology unchanged");
            return Ok(false);
        }
        let mut next = SeedRegistry::new();
        for (name, identity) in desired {
            let store = match current.seeds.get(name) {
                Some(e) if e.identity == *identity => Arc::clone(&e.store),
                _ => connect(name.clone()).await?,
            };
            next = next.with_identified_seed(name.clone(), identity.clone(), store);
        }
        self.replace(next);
        Ok(true)
    }
}
