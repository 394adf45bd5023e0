//! Entities describing the cluster as seen by the driver. The pool only
//! needs the per-node [`Host`] record; topology discovery lives above it.

mod host;

pub use host::Host;
