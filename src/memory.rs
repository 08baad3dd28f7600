//! Memory-monitor integration.

use std::sync::Arc;

use crate::error::ShrinkError;

/// A component able to give memory back under pressure.
///
/// The runner implements this for its batch queue: shrinking halves the
/// queue's maximum size and drops overflow. Work lost this way is rehydrated
/// by re-running the callback's initial walk once the shrunken queue drains,
/// so shrinking is safe as long as `init` can re-enumerate its corpus.
pub trait Shrinkable: Send + Sync {
    /// Contract the component. Errors once it is already at minimum size.
    fn shrink(&self) -> Result<(), ShrinkError>;

    /// Whether the component has ever shrunk below its initial size.
    fn is_shrunk(&self) -> bool;
}

/// External monitor that watches process memory and asks registered
/// components to shrink under pressure.
///
/// The runner only consumes this contract: it registers itself once at build
/// time, after which the monitor calls back through [`Shrinkable`]
/// concurrently with normal operation. Those calls are admitted through the
/// runner's serialization point like any other mutation.
pub trait MemoryMonitor: Send + Sync {
    /// Register a component the monitor may later ask to shrink.
    fn register_shrinkable(&self, handle: Arc<dyn Shrinkable>);
}
