pub mod authz_layer;
pub mod client;
pub mod server;
pub mod worker_service;

pub use authz_layer::AuthzLayer;
pub use client::connect;
pub use server::WorkerServer;
pub use worker_service::{WorkerApi, JOB_ID_METADATA};
