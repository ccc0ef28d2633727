pub mod stream;
pub mod types;

pub use types::*;
