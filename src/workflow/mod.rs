pub mod graph;
pub mod order;
pub mod prompts;
pub mod store;

pub use graph::{
    ConditionStep, HttpStep, NodeKind, PromptStep, VariableBinding, WorkflowEdge, WorkflowGraph,
    WorkflowNode,
};
pub use order::execution_order;
pub use prompts::{PromptTemplate, PromptTemplateStore};
pub use store::WorkflowStore;
