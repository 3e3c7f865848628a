//! railstack: typed deployment topology for a containerised Rails API.
//!
//! Four stacks (network, storage, API, CI) are declared as typed values,
//! wired together through cross-stack exports, ordered by a dependency
//! resolver and synthesized into a CloudFormation cloud assembly. A BLAKE3
//! lock next to the assembly drives `plan` and `verify`.

pub mod cli;
pub mod core;
pub mod stacks;
pub mod tripwire;
