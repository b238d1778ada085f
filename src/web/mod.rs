//! # HTTP Interface
//!
//! Actix web server exposing the classifier: a health route, `/predict`
//! and `/visualize`. Handlers live in `routes`, their error mapping in
//! `error`.

pub mod error;
pub mod routes;

pub use error::ApiError;
pub use routes::{configure, cors_layer, run_server, AppState};
