use std::sync::Arc;

use crate::caching::{CacheStore, QueryKey};
use crate::definitions::{QueryDefinition, QueryParams};

/// Whether a query may run right now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Enablement {
    Enabled,
    Disabled,
    /// A dependency entry has no data yet. Treated like [`Disabled`](Self::Disabled).
    DependencyUnresolved(QueryKey),
}

impl Enablement {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Derives the enablement of queries from their params and other cache entries.
///
/// Enablement is computed on every call and never cached.
#[derive(Clone, Debug)]
pub struct EnablementResolver {
    store: Arc<CacheStore>,
}

impl EnablementResolver {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    /// Evaluates the static predicate, every dependency check, the configured override and the
    /// caller's override, in that order.
    ///
    /// Overrides can only narrow: `Some(true)` keeps the computed result, `Some(false)`
    /// disables the query.
    pub fn evaluate(
        &self,
        definition: &QueryDefinition,
        params: &QueryParams,
        caller_override: Option<bool>,
    ) -> Enablement {
        if let Some(predicate) = definition.static_predicate {
            if !predicate(params) {
                return Enablement::Disabled;
            }
        }

        for dependency in &definition.dependencies {
            let data = self
                .store
                .peek(&dependency.key)
                .and_then(|entry| entry.data);
            match data {
                None => return Enablement::DependencyUnresolved(dependency.key.clone()),
                Some(data) if !(dependency.test)(&data) => return Enablement::Disabled,
                Some(_) => {}
            }
        }

        let allowed = [definition.options.enabled, caller_override]
            .into_iter()
            .flatten()
            .all(|allowed| allowed);

        if allowed {
            Enablement::Enabled
        } else {
            Enablement::Disabled
        }
    }

    pub fn resolve(
        &self,
        definition: &QueryDefinition,
        params: &QueryParams,
        caller_override: Option<bool>,
    ) -> bool {
        self.evaluate(definition, params, caller_override)
            .is_enabled()
    }
}
