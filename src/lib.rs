// Library exports for the binary and integration tests

pub mod api;
pub mod app_context;
pub mod config;
pub mod credentials;
pub mod import;
pub mod net;

pub use app_context::AppContext;

// Test support (only available with test-utils feature)
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;
