//! Enforcement backends for the set manager.
//!
//! Two variants implement the same [`netpol_dataplane_core::SetBackend`]
//! contract: [`command::CommandBackend`] drives the userland set-management
//! tool, and [`endpoint::EndpointPolicyBackend`] programs virtualization
//! endpoint policies. The manager selects one at construction time and never
//! sees variant-specific vocabulary.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod command;
pub mod endpoint;

pub use self::command::{CommandBackend, Exec, SystemExec};
pub use self::endpoint::{EndpointApi, EndpointPolicyBackend, SetPolicyKind, SetPolicySetting};
