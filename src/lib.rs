//! Back-office services: loan amortization, subscription billing and
//! approval workflows behind one axum API.

pub mod auth;
pub mod clock;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod locks;
pub mod models;
pub mod openapi;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
