pub mod auth;
pub mod calendar;
pub mod compactor;
pub mod config;
pub mod devices;
pub mod engine;
pub mod identity;
pub mod limits;
pub mod model;
pub mod observability;
pub mod service;
pub mod sql;
pub mod tls;
pub mod view;
pub mod wal;
pub mod wire;
