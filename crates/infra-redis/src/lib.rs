// vidforge Infrastructure - Redis Adapter
// Implements: Broker

mod broker;
mod config;

pub use broker::RedisBroker;
pub use config::RedisBrokerConfig;
