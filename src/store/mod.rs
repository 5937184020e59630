//! Incident state: reports, alerts and shelters behind one consistent store.

pub mod backend;
pub mod model;
pub mod state;

pub use backend::{MemoryBackend, PersistedState, StateBackend};
pub use model::{Alert, AlertId, NewAlert, NewShelter, Shelter, ShelterId};
pub use state::{IncidentSnapshot, IncidentStore, StateUpdate};
