//! The specification expansion engine: grammar, symbol resolution, the
//! directive expander, the cluster model, and the multi-phase loader.

pub mod error;
pub mod expander;
pub mod grammar;
pub mod loader;
pub mod model;
pub mod symbols;
