pub mod memory;
pub mod resource;
pub mod store;
