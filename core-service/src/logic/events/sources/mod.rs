//! Log Sources
//!
//! Restartable producers feeding the event bus. Each source runs as its own
//! task so a stalled source cannot block the others; the daemon supervisor
//! restarts crashed sources with exponential backoff.

pub mod parsers;
pub mod tail;

use std::sync::Arc;

pub use parsers::Parser;
pub use tail::TailSource;

use crate::logic::events::EventBus;
use crate::logic::store::Store;

/// Shared handles every source gets at start.
#[derive(Clone)]
pub struct SourceContext {
    pub bus: Arc<EventBus>,
    pub store: Arc<Store>,
}
