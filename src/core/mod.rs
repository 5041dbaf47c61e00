/// Canonical types shared by every venue connector and the engine.
pub mod types;

/// Error taxonomy for everything below the connector boundary.
pub mod error;

/// Per-(venue, symbol) order book and statistics kernel.
pub mod book;

/// Venue adapter trait and concrete connector implementations.
pub mod connector;

/// Multi-venue coordinator.
pub mod engine;

/// Logging configuration and implementation load util.
pub mod logging;

/// Sum of all core sub-modules' configs.
pub mod config;
