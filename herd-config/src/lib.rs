// Submodules
pub mod core;
pub mod error;
pub mod general;
pub mod provision;
pub mod store;

pub use core::Config;
pub use error::Error;
pub use general::General;
pub use provision::Provision;
pub use store::Store;
