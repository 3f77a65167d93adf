//! The knowledge-maintenance engine: reconciler, ingestion pipeline, and
//! per-project event fan-out.  The stores are the only shared state; every
//! mutation passes through the reconciler under the project lock.

mod bus;
mod events;
mod pipeline;
mod reconciler;

pub use bus::EventBus;
pub use events::ProjectEvent;
pub use pipeline::{IngestOutcome, Pipeline, ScriptPublisher};
pub use reconciler::{ReconcileOutcome, reconcile, validate_script};
