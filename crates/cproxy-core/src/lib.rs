pub mod admission;
pub mod config;
pub mod credentials;
pub mod decorate;
pub mod error;
pub mod oauth;
pub mod paths;
pub mod session;
pub mod telemetry;
pub mod token;
pub mod upstream;
pub mod watcher;

pub use error::ProxyError;
