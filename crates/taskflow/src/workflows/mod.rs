pub mod dag;
pub mod model;
pub mod resolver;

pub use model::{
    DependencyEdge, Workflow, WorkflowCounts, WorkflowCreated, WorkflowGraph, WorkflowState,
    WorkflowStatus, WorkflowTaskSpec, WorkflowTaskStatus,
};
pub use resolver::{DependencyResolver, SweepReport};
