pub mod config;
pub mod error;
pub mod layout;

pub use config::{parse_size, MpeConfig};
pub use error::{ErrorClass, MpeError, MpeResult};
pub use layout::Layout;
