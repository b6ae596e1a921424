pub mod errors;
pub mod persist;

pub use errors::*;
pub use persist::*;
