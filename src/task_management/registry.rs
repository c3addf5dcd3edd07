//! # Task Context Registry
//!
//! Owns every named [`AsyncTaskContext`] of one application instance. Contexts are
//! created lazily on first lookup and live until [`TaskContextRegistry::shutdown_all`].
//!
//! The registry is an ordinary value: the host creates one, hands clones of the `Arc`
//! to whatever needs off-thread work, and shuts it down at teardown.

use super::{AsyncTaskContext, TaskContextSettings};
use crate::core::MtResource;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;

/// Lazily-populated map from context name to [`AsyncTaskContext`].
///
/// # Examples
/// ```
/// use placement_ledger::task_management::{TaskContextRegistry, TaskContextSettings};
/// use std::sync::Arc;
///
/// let registry = TaskContextRegistry::new(TaskContextSettings::default());
/// let first = registry.get_or_create("RegionBlock-IO");
/// let second = registry.get_or_create("RegionBlock-IO");
/// assert!(Arc::ptr_eq(&first, &second));
/// registry.shutdown_all();
/// ```
pub struct TaskContextRegistry {
    contexts: MtResource<HashMap<String, Arc<AsyncTaskContext>>>,
    settings: TaskContextSettings,
}

impl TaskContextRegistry {
    /// Creates an empty registry; every context it creates uses `settings`.
    pub fn new(settings: TaskContextSettings) -> Self {
        Self {
            contexts: MtResource::new(HashMap::new()),
            settings,
        }
    }

    /// Returns the context registered under `name`, creating it on first use.
    ///
    /// Concurrent first lookups of the same name construct exactly one context.
    pub fn get_or_create(&self, name: &str) -> Arc<AsyncTaskContext> {
        if let Some(context) = self.contexts.get().get(name) {
            return context.clone();
        }

        self.contexts
            .get_mut()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncTaskContext::new(name, self.settings.clone())))
            .clone()
    }

    /// Number of contexts created so far.
    pub fn len(&self) -> usize {
        self.contexts.get().len()
    }

    /// Whether no context has been created yet.
    pub fn is_empty(&self) -> bool {
        self.contexts.get().is_empty()
    }

    /// Shuts down every registered context and forgets them.
    ///
    /// Holders of an already-obtained context keep a working handle: after shutdown it
    /// simply runs submissions inline. A later `get_or_create` starts a fresh context.
    pub fn shutdown_all(&self) {
        let contexts: Vec<_> = self.contexts.get_mut().drain().collect();
        info!("Shutting down {} task context(s)", contexts.len());
        for (_, context) in contexts {
            context.shutdown();
        }
    }
}
