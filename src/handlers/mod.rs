// src/handlers/mod.rs

pub mod approvals;
pub mod general;
pub mod loans;
pub mod payments;
pub mod portal;
pub mod subscriptions;
