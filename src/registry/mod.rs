pub mod reconciler;
pub mod source;

pub use reconciler::{ReconcileReport, Reconciler};
pub use source::{FileRegistry, RegistryEntry, RegistrySnapshot, RegistrySource};
