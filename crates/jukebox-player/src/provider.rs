//! Track providers and the name-keyed registry the player resolves them through.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

/// Raw s16le, interleaved stereo, 44.1 kHz audio for one track.
pub type TrackStream = Box<dyn Read + Send>;

/// A source of tracks addressed by provider-specific ids.
pub trait Provider: Send + Sync {
    /// Name clients use in `providerName`.
    fn name(&self) -> &str;

    /// Open a stream for `track_id`.
    fn stream(&self, track_id: &str) -> anyhow::Result<TrackStream>;
}

/// Providers by name. Later registrations replace earlier ones with the same name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        if self.providers.insert(name.clone(), provider).is_some() {
            tracing::warn!(provider = %name, "provider replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
