//! Core synthesis logic: types, config parsing, the construct model,
//! resolution, rendering, locking and planning.

pub mod assertions;
pub mod cidr;
pub mod intrinsics;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod stack;
pub mod state;
pub mod synth;
pub mod types;
