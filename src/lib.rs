/// Order book, connectors, engine, canonical types, error taxonomy.
pub mod core;

/// Summary of the whole application's configuration.
pub mod config;

/// Push-socket/WebSocket server and its wire protocol.
pub mod broadcast;

/// Process entry point wiring config, logging, the engine and the server.
pub mod run;
