//! Maps location strings onto backends.

use std::sync::Arc;

use crate::descriptor::Backend;
use crate::error::{Error, Result};

/// Creates backends for the locations it recognizes.
pub trait BackendFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, location: &str) -> bool;

    fn create(&self, location: &str) -> Result<Arc<dyn Backend>>;

    /// Tears down any connections the factory's backends share.
    fn close(&self) {}
}

struct Registration {
    factory: Arc<dyn BackendFactory>,
    weight: i32,
}

/// Ordered set of backend factories. Factories are consulted in ascending weight order and the
/// first one that matches a location creates its backend.
#[derive(Default)]
pub struct Resolver {
    // kept sorted by weight, registration order breaks ties
    registrations: std::sync::RwLock<Vec<Registration>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, factory: Arc<dyn BackendFactory>, weight: i32) {
        tracing::debug!("registering backend {} with weight {}", factory.name(), weight);
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registrations.push(Registration { factory, weight });
        registrations.sort_by_key(|registration| registration.weight);
    }

    fn factory_for(&self, location: &str) -> Option<Arc<dyn BackendFactory>> {
        self.registrations
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .find(|registration| registration.factory.matches(location))
            .map(|registration| registration.factory.clone())
    }

    pub fn resolve(&self, location: &str) -> Result<Arc<dyn Backend>> {
        let factory = self
            .factory_for(location)
            .ok_or_else(|| Error::UnsupportedLocation(location.to_string()))?;
        tracing::trace!("{} handles {:?}", factory.name(), location);
        factory.create(location)
    }

    pub fn close(&self) {
        for registration in self
            .registrations
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
        {
            registration.factory.close();
        }
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let names: Vec<_> = self
            .registrations
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|registration| (registration.factory.name(), registration.weight))
            .collect();
        f.debug_struct("Resolver").field("backends", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::local::{LocalBackend, LocalFactory};

    struct CatchAll;

    impl BackendFactory for CatchAll {
        fn name(&self) -> &'static str {
            "catch-all"
        }

        fn matches(&self, _location: &str) -> bool {
            true
        }

        fn create(&self, _location: &str) -> Result<Arc<dyn Backend>> {
            Ok(LocalBackend::new("/catch/all"))
        }
    }

    #[test]
    fn lowest_weight_wins() -> anyhow::Result<()> {
        let resolver = Resolver::new();
        resolver.register(Arc::new(CatchAll), 50);
        resolver.register(Arc::new(LocalFactory), 0);
        let backend = resolver.resolve("/tmp/foo")?;
        assert_eq!(backend.location().to_string(), "/tmp/foo");
        let backend = resolver.resolve("sftp://host/foo")?;
        assert_eq!(backend.location().to_string(), "/catch/all");
        Ok(())
    }

    #[test]
    fn unmatched_location_is_an_error() {
        let resolver = Resolver::new();
        resolver.register(Arc::new(LocalFactory), 0);
        assert!(matches!(
            resolver.resolve("sftp://host/foo"),
            Err(Error::UnsupportedLocation(_))
        ));
    }
}
