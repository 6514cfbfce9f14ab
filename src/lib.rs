// Library exports for courier.
// Integration tests and benches drive the dispatcher through these modules.

pub mod core;
pub mod db;
pub mod dispatcher;
pub mod logging;
pub mod registry;
pub mod services;
pub mod utils;
