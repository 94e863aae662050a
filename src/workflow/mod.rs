mod graph;

pub use graph::ProcessGraph;
