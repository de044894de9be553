//! vcluster: declarative virtual cluster topologies.
//!
//! A specification document describes machines, services and cloud
//! parameters; a small directive grammar lets the document reference the
//! cluster being built from it. The expansion engine rewrites the document
//! into a fully-resolved machine/service graph that drives provisioning.

pub mod cli;
pub mod core;
pub mod inventory;
pub mod provision;
pub mod state;
