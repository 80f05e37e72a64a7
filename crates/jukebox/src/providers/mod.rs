//! Provider adapters and registry construction from config.

pub mod http;
pub mod local;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jukebox_player::provider::ProviderRegistry;

use crate::config::ProviderConfig;

pub use http::{HttpProvider, HttpRangeConfig};
pub use local::LocalProvider;

/// Build a registry holding one provider per `[providers.<name>]` entry.
pub fn registry_from_config(
    providers: &BTreeMap<String, ProviderConfig>,
    resample_chunk_frames: usize,
) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    for (name, cfg) in providers {
        match cfg {
            ProviderConfig::Local { root } => {
                let provider = LocalProvider::new(name.clone(), root, resample_chunk_frames)
                    .with_context(|| format!("configure provider {name}"))?;
                registry.register(Arc::new(provider));
            }
            ProviderConfig::Http {
                url_template,
                block_size,
                timeout_ms,
            } => {
                let mut range = HttpRangeConfig::default();
                if let Some(size) = block_size.filter(|s| *s > 0) {
                    range.block_size = size;
                }
                if let Some(ms) = timeout_ms.filter(|ms| *ms > 0) {
                    range.timeout = Duration::from_millis(ms);
                }
                let provider = HttpProvider::new(
                    name.clone(),
                    url_template.clone(),
                    range,
                    resample_chunk_frames,
                )
                .with_context(|| format!("configure provider {name}"))?;
                registry.register(Arc::new(provider));
            }
        }
        tracing::info!(provider = %name, kind = kind_name(cfg), "provider registered");
    }
    Ok(registry)
}

fn kind_name(cfg: &ProviderConfig) -> &'static str {
    match cfg {
        ProviderConfig::Local { .. } => "local",
        ProviderConfig::Http { .. } => "http",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_registry_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut providers = BTreeMap::new();
        providers.insert(
            "files".to_string(),
            ProviderConfig::Local {
                root: dir.path().to_string_lossy().into_owned(),
            },
        );
        providers.insert(
            "soundcloud".to_string(),
            ProviderConfig::Http {
                url_template: "https://api.example.com/tracks/{track}/stream".to_string(),
                block_size: Some(64 * 1024),
                timeout_ms: None,
            },
        );
        providers.insert(
            "googlemusic".to_string(),
            ProviderConfig::Http {
                url_template: "https://music.example.com/{track}".to_string(),
                block_size: None,
                timeout_ms: Some(2000),
            },
        );

        let registry = registry_from_config(&providers, 1024).unwrap();
        assert_eq!(registry.names(), vec!["files", "googlemusic", "soundcloud"]);
    }

    #[test]
    fn bad_provider_config_fails() {
        let mut providers = BTreeMap::new();
        providers.insert(
            "files".to_string(),
            ProviderConfig::Local {
                root: "/nonexistent/music/root".to_string(),
            },
        );
        let err = registry_from_config(&providers, 1024).err().unwrap();
        assert!(format!("{err:#}").contains("configure provider files"));
    }
}
