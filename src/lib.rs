//! The _meshca_ library crate.
//!
//! A certificate authority core for service mesh workload identity across
//! multiple datacenters. The primary datacenter owns the root, secondaries
//! get their signing intermediates from it.

pub mod api;
pub mod commons;
pub mod config;
pub mod constants;
pub mod provider;
pub mod server;
