// Environment and file configuration
pub mod config;

// Durable session credential storage
pub mod credentials;

// Session validity checks before privileged calls
pub mod guard;

// Login URL, request token capture and exchange
pub mod auth;

// Broker orders and portfolio
pub mod trading;

// Tool catalogue and dispatch
pub mod tools;

// HTTP routers for the callback and MCP servers
pub mod api;

pub mod shutdown;
