//! # Billing Hex
//!
//! Application services, payment provider adapters and the HTTP adapter for
//! the billing core.
//!
//! ## Architecture
//!
//! - `service/` - Wallet ledger, payment gateway, subscription engine and the
//!   `BillingService` façade that combines them
//! - `outbound/` - Payment provider adapters (sandbox, hosted checkout)
//! - `inbound/` - HTTP adapter (Axum server)
//! - `workers` - Expiry sweeper and pending payment reconciler
//!
//! The services are generic over `R: BillingRepository`, allowing
//! different repository implementations to be injected.

pub mod inbound;
pub mod locks;
pub mod openapi;
pub mod outbound;
pub mod security;
pub mod service;
pub mod workers;

#[cfg(test)]
mod service_tests;

pub use service::{BillingConfig, BillingService, GatewayConfig, Settlement};
