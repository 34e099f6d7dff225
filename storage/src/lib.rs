//! Adapters behind the visibility ports: Postgres persistence and hierarchy
//! queries, Redis Streams notification delivery.

pub mod events;
pub mod postgres;

pub use events::RedisGateway;
pub use postgres::PostgresBackend;
