//! Backend registry (C2): the fixed, startup-ordered list of browser-
//! automation backends, their busy flags, and cached liveness probes.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

/// Cached liveness probe result for one backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendHealth {
    pub ok: bool,
    pub checked_at: Instant,
}

impl BackendHealth {
    fn stale(now: Instant) -> Self {
        // `checked_at` far enough in the past that the first probe always
        // runs, regardless of cache interval.
        Self {
            ok: false,
            checked_at: now - Duration::from_secs(3600),
        }
    }

    fn is_fresh(&self, now: Instant, cache_interval: Duration) -> bool {
        now.saturating_duration_since(self.checked_at) < cache_interval
    }
}

struct BackendState {
    url: String,
    busy: bool,
    health: BackendHealth,
}

/// One backend slot: index into the registry doubles as the `slot_id`
/// suffix (`worker_id:index`).
pub struct BackendRegistry {
    backends: Vec<Mutex<BackendState>>,
    http: reqwest::Client,
    healthcheck_path: String,
    healthcheck_timeout: Duration,
    healthcheck_cache: Duration,
}

/// A backend selected for dispatch: its stable index and URL.
#[derive(Debug, Clone)]
pub struct FreeBackend {
    pub index: usize,
    pub url: String,
}

impl BackendRegistry {
    pub fn new(
        urls: Vec<String>,
        healthcheck_path: String,
        healthcheck_timeout: Duration,
        healthcheck_cache: Duration,
    ) -> crate::error::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(healthcheck_timeout)
            .build()?;
        let now = Instant::now();
        let backends = urls
            .into_iter()
            .map(|url| {
                Mutex::new(BackendState {
                    url,
                    busy: false,
                    health: BackendHealth::stale(now),
                })
            })
            .collect();

        Ok(Self {
            backends,
            http,
            healthcheck_path,
            healthcheck_timeout,
            healthcheck_cache,
        })
    }

    /// Test-only constructor that marks every backend healthy up front,
    /// so dispatcher scenario tests don't need a real HTTP server to
    /// satisfy the healthcheck probe.
    #[cfg(test)]
    pub(crate) fn new_all_healthy(urls: Vec<String>) -> crate::error::Result<Self> {
        let mut registry = Self::new(
            urls,
            "/health".to_string(),
            Duration::from_secs(1),
            Duration::from_secs(3600),
        )?;
        for state in &mut registry.backends {
            state.get_mut().health = BackendHealth {
                ok: true,
                checked_at: Instant::now(),
            };
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Refresh (if stale) and return the liveness of one backend.
    async fn is_healthy(&self, index: usize) -> bool {
        let mut state = self.backends[index].lock().await;
        let now = Instant::now();
        if state.health.is_fresh(now, self.healthcheck_cache) {
            return state.health.ok;
        }

        let url = format!(
            "{}/{}",
            state.url.trim_end_matches('/'),
            self.healthcheck_path.trim_start_matches('/')
        );
        let ok = match self
            .http
            .get(&url)
            .timeout(self.healthcheck_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        };
        if !ok {
            warn!(backend = %state.url, "healthcheck failed");
        }
        state.health = BackendHealth {
            ok,
            checked_at: now,
        };
        ok
    }

    /// Backends that are currently idle and healthy, probing any backend
    /// whose cached health is stale. Probes run concurrently; one slow
    /// backend never blocks evaluation of another.
    pub async fn free_healthy(&self) -> Vec<FreeBackend> {
        let checks = (0..self.backends.len()).map(|i| async move {
            let busy = self.backends[i].lock().await.busy;
            if busy {
                return None;
            }
            if self.is_healthy(i).await {
                let url = self.backends[i].lock().await.url.clone();
                Some(FreeBackend { index: i, url })
            } else {
                None
            }
        });
        futures::future::join_all(checks)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    pub async fn mark_busy(&self, index: usize) {
        self.backends[index].lock().await.busy = true;
    }

    pub async fn mark_free(&self, index: usize) {
        self.backends[index].lock().await.busy = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_registry_has_no_free_backends() {
        let reg = BackendRegistry::new(
            vec![],
            "/".to_string(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(reg.free_healthy().await.is_empty());
    }

    #[tokio::test]
    async fn busy_backend_is_excluded() {
        let reg = BackendRegistry::new(
            vec!["http://127.0.0.1:1".to_string()],
            "/".to_string(),
            Duration::from_millis(50),
            Duration::from_secs(60),
        )
        .unwrap();
        reg.mark_busy(0).await;
        // Even though the healthcheck will fail (nothing listening), busy
        // short-circuits before the probe.
        assert!(reg.free_healthy().await.is_empty());
        reg.mark_free(0).await;
    }
}
