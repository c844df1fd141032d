//! Event-driven scheduling core: the admission controller that moves ready
//! phases into execution under the concurrency cap, and the dependency
//! resolver that reacts to terminal transitions.

pub mod admission;
pub mod resolver;

pub use admission::AdmissionController;
pub use resolver::DependencyResolver;
