//! Registry of named circuit breakers.
//!
//! Each registry owns its own map; there is no process-wide instance. Breakers created through
//! the registry share one template (threshold, reset timeout, clock, observers) but keep
//! independent state, so one failing dependency never trips another.

use crate::circuit_breaker::{BreakerStats, CircuitBreaker, StateObserver};
use crate::clock::Clock;
use crate::ConfigError;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The requested circuit breaker was never created.
    #[error("circuit breaker '{name}' not found")]
    NotFound { name: String },
}

/// Instance-owned map from resource name to [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct BreakerRegistry {
    template: CircuitBreaker,
    breakers: Arc<DashMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Registry whose breakers trip after `failure_threshold` consecutive failures and allow a
    /// trial call after `reset_timeout`.
    pub fn new(failure_threshold: usize, reset_timeout: Duration) -> Result<Self, ConfigError> {
        Ok(Self {
            template: CircuitBreaker::new("template", failure_threshold, reset_timeout)?,
            breakers: Arc::new(DashMap::new()),
        })
    }

    /// Clock for breakers created from now on.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.template = self.template.with_clock(clock);
        self
    }

    /// Observer attached to breakers created from now on.
    pub fn with_observer(self, observer: StateObserver) -> Self {
        self.template.add_observer(observer);
        self
    }

    /// The breaker for `name`, created from the template on first use.
    pub fn get_or_create(&self, name: &str) -> CircuitBreaker {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(resource = name, "circuit breaker registered");
                self.template.sibling(name)
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Force one breaker back to Closed.
    pub fn reset(&self, name: &str) -> Result<(), RegistryError> {
        match self.breakers.get(name) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(RegistryError::NotFound { name: name.to_string() }),
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }

    /// Stats for every breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerStats> {
        let mut entries: Vec<BreakerStats> = self.breakers.iter().map(|b| b.stats()).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::clock::ManualClock;
    use crate::{CallContext, ResilienceError};
    use std::io;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    async fn trip(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(&CallContext::background(), || async {
                Err::<(), _>(ResilienceError::Inner(io::Error::other("down")))
            })
            .await;
    }

    #[test]
    fn rejects_invalid_template() {
        assert!(BreakerRegistry::new(0, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn breakers_are_isolated_per_name() {
        let registry = BreakerRegistry::new(1, Duration::from_secs(10)).unwrap();
        let payments = registry.get_or_create("payments");
        let search = registry.get_or_create("search");

        trip(&payments).await;
        assert_eq!(payments.state(), CircuitState::Open);
        assert_eq!(search.state(), CircuitState::Closed);
        assert_eq!(registry.get("payments").unwrap().state(), CircuitState::Open);
        assert_eq!(registry.get_or_create("payments").name(), "payments");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn reset_and_snapshot() {
        let clock = ManualClock::new();
        let registry = BreakerRegistry::new(1, Duration::from_secs(10))
            .unwrap()
            .with_clock(Arc::new(clock));
        trip(&registry.get_or_create("b")).await;
        registry.get_or_create("a");

        let names: Vec<_> = registry.snapshot().into_iter().map(|s| (s.name, s.state)).collect();
        assert_eq!(
            names,
            vec![("a".to_string(), CircuitState::Closed), ("b".to_string(), CircuitState::Open)]
        );

        registry.reset("b").unwrap();
        assert_eq!(registry.get("b").unwrap().state(), CircuitState::Closed);
        assert_eq!(
            registry.reset("missing"),
            Err(RegistryError::NotFound { name: "missing".into() })
        );
    }

    #[tokio::test]
    async fn template_observer_reaches_created_breakers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let registry = BreakerRegistry::new(1, Duration::from_secs(10)).unwrap().with_observer(
            Arc::new(move |name: &str, _from: CircuitState, to: CircuitState| {
                sink.lock().unwrap().push((name.to_string(), to));
            }),
        );
        trip(&registry.get_or_create("db")).await;
        registry.reset_all();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("db".to_string(), CircuitState::Open), ("db".to_string(), CircuitState::Closed)]
        );
    }

    #[test]
    fn creation_is_logged() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(SharedWriter(buffer.clone()))
            .with_max_level(tracing::Level::DEBUG)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let registry = BreakerRegistry::new(3, Duration::from_secs(1)).unwrap();
        registry.get_or_create("inventory");
        registry.get_or_create("inventory");

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(logs.matches("circuit breaker registered").count(), 1);
        assert!(logs.contains("inventory"));
    }
}
