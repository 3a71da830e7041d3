//! Shared orchestrator state
//!
//! Everything a service call needs, cheap to clone into spawned tasks.

use std::sync::Arc;

use crate::engine::{Driver, Reconciler};
use crate::events::EventBus;
use crate::locks::ActivityLocks;
use crate::store::DocumentStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub driver: Arc<Driver>,
    pub reconciler: Arc<Reconciler>,
    pub events: EventBus,
    pub locks: ActivityLocks,
}

impl AppState {
    pub fn new(store: Arc<dyn DocumentStore>, driver: Driver, events: EventBus) -> Self {
        let driver = Arc::new(driver);
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&driver)));
        Self {
            store,
            driver,
            reconciler,
            events,
            locks: ActivityLocks::new(),
        }
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }
}
