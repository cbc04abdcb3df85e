// src/services/mod.rs

pub mod amortization;
pub mod approval;
pub mod email;
pub mod hooks;
pub mod payment_provider;
pub mod subscription;
