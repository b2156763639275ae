//! Graphs of nodes.
//!
//! A graph is a set of nodes linked through the data objects bound to their
//! parameters. Nodes that write an object run before the nodes that read it.

pub mod node;
pub mod structure;
pub(crate) mod topology;

pub use node::NodeInfo;
pub use structure::GraphInfo;
