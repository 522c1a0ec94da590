//! Resource lifecycle capability.

use std::error::Error;

/// Boxed error carried by failed resource construction.
pub type LifecycleError = Box<dyn Error + Send + Sync + 'static>;

/// Capability a resource type must implement to be pooled.
///
/// `activate`, `deactivate`, and `validate` are probes: returning `false`
/// marks the resource broken and takes it out of circulation. The defaults
/// accept everything, so a minimal implementation only provides `create`.
///
/// The pool never holds its internal lock across any of these calls, so they
/// may block (network round-trips, handshakes) without stalling other callers.
pub trait ResourceLifecycle: Send + Sync + 'static {
    /// The resource type managed by this lifecycle.
    type Resource: Send + 'static;

    /// Construct a new resource instance.
    fn create(&self) -> Result<Self::Resource, LifecycleError>;

    /// Prepare a resource for checkout. Runs on every acquire.
    fn activate(&self, _resource: &mut Self::Resource) -> bool {
        true
    }

    /// Quiesce a resource on its way back to the idle set.
    fn deactivate(&self, _resource: &mut Self::Resource) -> bool {
        true
    }

    /// Probe whether a resource is still usable.
    fn validate(&self, _resource: &mut Self::Resource) -> bool {
        true
    }

    /// Tear down a resource permanently. The default just drops it.
    fn destroy(&self, resource: Self::Resource) {
        drop(resource);
    }
}
