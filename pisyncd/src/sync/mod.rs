pub mod backoff;
pub mod conflict;
pub mod connection;
pub mod debounce;
pub mod engine;
pub mod filter;
pub mod index;
pub mod job;
pub mod paths;
pub mod queue;
pub mod registry;
pub mod transfer;
