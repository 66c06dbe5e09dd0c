use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use tw_types::{config_error, ConfigError, Instrument, InstrumentId};

pub type InstrumentMap = HashMap<InstrumentId, Arc<Instrument>>;

/// Read-mostly instrument registry. Readers take a cheap `Arc` of the current
/// map; registration copies the map under the writer lock.
#[derive(Debug, Default)]
pub struct InstrumentRegistry {
    inner: RwLock<Arc<InstrumentMap>>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_instruments(instruments: &[Instrument]) -> Result<Self, ConfigError> {
        let registry = Self::new();
        for inst in instruments {
            registry.register(inst.clone())?;
        }
        Ok(registry)
    }

    /// Registers an instrument. Registering an identical definition again is a
    /// no-op; a conflicting one is rejected since instruments are immutable.
    pub fn register(&self, instrument: Instrument) -> Result<(), ConfigError> {
        let mut guard = self.inner.write();
        if let Some(existing) = guard.get(&instrument.id) {
            if **existing == instrument {
                return Ok(());
            }
            return Err(config_error!(
                "instrument '{}' is already registered with different attributes",
                instrument.id
            ));
        }
        let mut next = (**guard).clone();
        next.insert(instrument.id.clone(), Arc::new(instrument));
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Instrument>> {
        self.inner.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains_key(id)
    }

    /// The current map; stays valid across later registrations.
    pub fn current(&self) -> Arc<InstrumentMap> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
