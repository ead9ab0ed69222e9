//! # Plexus Contracts
//!
//! Formal, typed declarations of the services plugins provide and consume.
//!
//! A [`ServiceContract`] names a service (reverse-DNS), carries a semantic
//! version, and lists its methods with typed parameters. The
//! [`ContractRegistry`] stores contracts per provider and resolves them by
//! minimum version, which lets call sites check method signatures before a
//! request is ever dispatched over the bus.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod registry;
pub mod types;

pub use registry::{ContractRegistry, RegisteredContract};
pub use types::{
    MethodCapabilities, ParameterType, ServiceContract, ServiceContractBuilder, ServiceMethod,
    ServiceMethodBuilder, ServiceParameter, ServiceRequirement, ServiceVersion,
};
