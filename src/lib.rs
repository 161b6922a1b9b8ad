pub mod config;
pub mod engine;
pub mod limits;
pub mod messages;
pub mod model;
pub mod negotiation;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod wal;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_support;
