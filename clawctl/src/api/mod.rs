//! HTTP surface: request/response models and handlers. Thin glue over the
//! store, the billing coordination logic, and the external clients.

pub mod handlers;
pub mod models;
