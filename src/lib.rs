pub mod daemon;
pub mod device;
pub mod error;
pub mod icc;
pub mod sync;
pub mod utils;

pub use error::{NetworkError, NetworkResult};
