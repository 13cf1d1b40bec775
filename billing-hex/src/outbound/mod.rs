//! Outbound adapters: the payment providers the gateway talks to.

pub mod providers;
