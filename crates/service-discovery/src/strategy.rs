//! Instance selection strategies

use crate::{
    error::{Error, Result},
    models::ServiceInstance,
    provider::ServiceProvider,
};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Chooses one instance from a provider's current snapshot
pub trait ProviderStrategy: Send + Sync {
    /// Pick an instance, or fail with [`Error::NoInstances`]
    fn get_instance(&self, provider: &dyn ServiceProvider) -> Result<ServiceInstance>;

    /// Strategy name for diagnostics
    fn name(&self) -> &'static str;
}

/// Uniform random choice
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomStrategy;

impl RandomStrategy {
    /// Creates a random strategy.
    pub fn new() -> Self {
        Self
    }
}

impl ProviderStrategy for RandomStrategy {
    fn get_instance(&self, provider: &dyn ServiceProvider) -> Result<ServiceInstance> {
        let instances = provider.get_all_instances();
        if instances.is_empty() {
            return Err(Error::NoInstances(provider.name().to_string()));
        }
        let index = rand::thread_rng().gen_range(0..instances.len());
        Ok(instances[index].clone())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Cycles through the snapshot in order
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    next: AtomicUsize,
}

impl RoundRobinStrategy {
    /// Creates a round-robin strategy starting at the first instance.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProviderStrategy for RoundRobinStrategy {
    fn get_instance(&self, provider: &dyn ServiceProvider) -> Result<ServiceInstance> {
        let instances = provider.get_all_instances();
        if instances.is_empty() {
            return Err(Error::NoInstances(provider.name().to_string()));
        }
        // Snapshot size may change between calls, so wrap on read
        let index = self.next.fetch_add(1, Ordering::Relaxed) % instances.len();
        Ok(instances[index].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Snapshot;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct FixedProvider {
        instances: Snapshot,
    }

    impl FixedProvider {
        fn with(count: usize) -> Self {
            let instances: Vec<ServiceInstance> = (0..count)
                .map(|i| {
                    ServiceInstance::builder("api")
                        .id(i.to_string())
                        .build()
                        .unwrap()
                })
                .collect();
            Self {
                instances: Arc::from(instances),
            }
        }
    }

    impl ServiceProvider for FixedProvider {
        fn name(&self) -> &str {
            "api"
        }

        fn get_all_instances(&self) -> Snapshot {
            self.instances.clone()
        }

        fn get_instance(&self) -> Result<ServiceInstance> {
            RandomStrategy.get_instance(self)
        }
    }

    #[test]
    fn test_random_is_roughly_uniform() {
        let provider = FixedProvider::with(3);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..3000 {
            let instance = RandomStrategy.get_instance(&provider).unwrap();
            *counts.entry(instance.id).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert!((800..=1200).contains(count), "skewed counts: {:?}", counts);
        }
    }

    #[test]
    fn test_empty_snapshot_is_typed_error() {
        let provider = FixedProvider::with(0);
        for strategy in [
            &RandomStrategy as &dyn ProviderStrategy,
            &RoundRobinStrategy::new(),
        ] {
            match strategy.get_instance(&provider) {
                Err(Error::NoInstances(name)) => assert_eq!(name, "api"),
                other => panic!("{} returned {:?}", strategy.name(), other),
            }
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let provider = FixedProvider::with(3);
        let strategy = RoundRobinStrategy::new();
        let ids: Vec<String> = (0..5)
            .map(|_| strategy.get_instance(&provider).unwrap().id)
            .collect();
        assert_eq!(ids, vec!["0", "1", "2", "0", "1"]);
    }
}
