use crate::error::Result;
use crate::model::{ListSource, Provider};
use crate::store::SuppressionStore;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Lock-free snapshot of provider configuration for the read path.
///
/// Writers (seeding, the sync worker) persist to the store first and then
/// swap in a fresh snapshot; readers never block.
pub struct ProviderRegistry {
    providers: ArcSwap<Vec<Arc<Provider>>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Provider>) -> Self {
        Self {
            providers: ArcSwap::from_pointee(Self::normalize(providers)),
        }
    }

    pub async fn load(store: &dyn SuppressionStore) -> Result<Self> {
        Ok(Self::new(store.list_providers().await?))
    }

    /// Built-ins are always present and enabled; order is priority desc, then id.
    fn normalize(providers: Vec<Provider>) -> Vec<Arc<Provider>> {
        let mut list: Vec<Provider> = providers;
        for source in [ListSource::Internal, ListSource::Custom] {
            let builtin = Provider::builtin(source);
            match list.iter_mut().find(|p| p.id == builtin.id) {
                Some(existing) => existing.enabled = true,
                None => list.push(builtin),
            }
        }
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        list.into_iter().map(Arc::new).collect()
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<Provider>>> {
        self.providers.load_full()
    }

    pub fn enabled(&self) -> Vec<Arc<Provider>> {
        self.providers
            .load()
            .iter()
            .filter(|p| p.enabled)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Provider>> {
        self.providers.load().iter().find(|p| p.id == id).cloned()
    }

    pub fn upsert(&self, provider: Provider) {
        let provider = Arc::new(provider);
        self.providers.rcu(|current| {
            let mut next: Vec<Provider> = current
                .iter()
                .filter(|p| p.id != provider.id)
                .map(|p| (**p).clone())
                .collect();
            next.push((*provider).clone());
            Self::normalize(next)
        });
    }

    pub fn replace(&self, providers: Vec<Provider>) {
        self.providers.store(Arc::new(Self::normalize(providers)));
    }
}
