//! Thread-safe mapping from operation names to handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::RegistryError;
use crate::handler::{AdvancedJob, AdvancedJobFactory, HandlerResult, SimpleHandler};
use crate::job::JobRecord;

/// Two registries keyed by operation name, one per handler flavor.
///
/// Registration is expected to be rare and lookups frequent, so both maps
/// sit behind a reader/writer lock. During dispatch the advanced registry
/// is consulted first.
#[derive(Default)]
pub struct HandlerRegistry {
    simple: RwLock<HashMap<String, SimpleHandler>>,
    advanced: RwLock<HashMap<String, AdvancedJobFactory>>,
}

/// The handler chosen for one execution.
pub(crate) enum ResolvedHandler {
    Advanced(AdvancedJobFactory),
    Simple(SimpleHandler),
}

impl HandlerRegistry {
    pub fn register_simple<F, Fut>(
        &self,
        operation: impl Into<String>,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let operation = operation.into();
        let mut map = self.simple.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&operation) {
            return Err(RegistryError::DuplicateHandler(operation));
        }
        let handler: SimpleHandler = Arc::new(move |job| {
            Box::pin(handler(job)) as futures::future::BoxFuture<'static, HandlerResult>
        });
        map.insert(operation, handler);
        Ok(())
    }

    pub fn register_advanced<F, J>(
        &self,
        operation: impl Into<String>,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn() -> J + Send + Sync + 'static,
        J: AdvancedJob + 'static,
    {
        let operation = operation.into();
        let mut map = self
            .advanced
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&operation) {
            return Err(RegistryError::DuplicateHandler(operation));
        }
        let factory: AdvancedJobFactory =
            Arc::new(move || Box::new(factory()) as Box<dyn AdvancedJob>);
        map.insert(operation, factory);
        Ok(())
    }

    pub(crate) fn resolve(&self, operation: &str) -> Option<ResolvedHandler> {
        {
            let advanced = self
                .advanced
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(factory) = advanced.get(operation) {
                return Some(ResolvedHandler::Advanced(factory.clone()));
            }
        }
        let simple = self.simple.read().unwrap_or_else(PoisonError::into_inner);
        simple
            .get(operation)
            .cloned()
            .map(ResolvedHandler::Simple)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::RegistryError;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct NoopJob;

    #[async_trait]
    impl AdvancedJob for NoopJob {
        async fn run(
            &mut self,
            _job: JobRecord,
            _cancellation: CancellationToken,
        ) -> HandlerResult {
            Ok(None)
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = HandlerRegistry::default();
        registry
            .register_simple("echo", |_job| async { Ok(None) })
            .unwrap();
        let err = registry
            .register_simple("echo", |_job| async { Ok(None) })
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateHandler(op) if op == "echo"));

        registry.register_advanced("echo", || NoopJob).unwrap();
        let err = registry
            .register_advanced("echo", || NoopJob)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateHandler(op) if op == "echo"));
    }

    #[test]
    fn advanced_wins_over_simple() {
        let registry = HandlerRegistry::default();
        registry
            .register_simple("sync", |_job| async { Ok(None) })
            .unwrap();
        registry.register_advanced("sync", || NoopJob).unwrap();

        assert!(matches!(
            registry.resolve("sync"),
            Some(ResolvedHandler::Advanced(_))
        ));
        assert!(matches!(
            registry.resolve("unknown"),
            None
        ));
    }
}
