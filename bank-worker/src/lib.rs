//! Simple Bank - banking service backend with an at-least-once background
//! task pipeline.
//!
//! This library provides shared modules for the two binaries:
//! - `bank-server`: HTTP API plus the task processor under one orchestrator
//! - `bank-processor`: Task processor only
//!
//! ## Architecture
//!
//! ```text
//! POST /users → Store → TaskDistributor → Broker → TaskProcessor → handler → Mailer
//! ```

pub mod broker;
pub mod config;
pub mod distributor;
pub mod lifecycle;
pub mod mail;
pub mod processor;
pub mod store;
pub mod task;
pub mod tasks;
pub mod telemetry;
pub mod web;

// Re-export commonly used types
pub use broker::{Broker, BrokerError, DeadLetter, LaneStats, Lease};
pub use config::Config;
pub use distributor::{BrokerTaskDistributor, DistributeError, TaskDistributor};
pub use lifecycle::{Component, ComponentState, Orchestrator};
pub use processor::{
    HandlerMux, ProcessorComponent, ProcessorConfig, TaskError, TaskHandler, TaskProcessor,
};
pub use task::{Envelope, NewTask, TaskId, TaskOptions};
pub use web::AppState;
