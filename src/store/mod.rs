pub mod models;
pub mod registry;
pub mod signals;

pub use models::{DecisionExtras, DecisionKind, DecisionRow, SignalRow};
pub use registry::Registry;
pub use signals::SignalStore;
