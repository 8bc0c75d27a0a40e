pub mod api;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod events;
pub mod geo;
pub mod reconcile;
pub mod store;
pub mod ws;
