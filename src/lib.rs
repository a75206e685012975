#![cfg_attr(not(test), no_std)]

//! FF-A memory-sharing proxy for a pKVM-style EL2 hypervisor.
//!
//! The host kernel is not trusted with the secure world's view of memory.
//! Every FF-A call it makes is offered to [`ffa::proxy::FfaProxy`], which
//! checks memory transactions against the host's page ownership before the
//! SPMC ever sees them.

pub mod config;
pub mod ffa;
pub mod logger;
pub mod sync;

pub use config::ProxyConfig;
pub use ffa::init::{negotiate, Capabilities, DisabledReason, InitError, Negotiation};
pub use ffa::proxy::{FfaDispatch, FfaProxy};
pub use ffa::{FfaError, SmcArgs, SmcResult};
