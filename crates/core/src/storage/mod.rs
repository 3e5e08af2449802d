pub mod state;

pub use state::{NoopStateStore, RedbStateStore, StateStore};
