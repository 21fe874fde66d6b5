// Port Layer - Interfaces for external dependencies

pub mod generator;
pub mod resource_store;

// Re-exports
pub use generator::ResourceGenerator;
pub use resource_store::ResourceStore;
