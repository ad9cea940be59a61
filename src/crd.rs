//! `Plan` CRD type definition.

pub mod spec;
pub mod status;
pub mod types;

pub use spec::{Plan, PlanSpec};
pub use status::{PlanCondition, PlanStatus};
pub use types::{ContainerSpec, DrainSpec, NodeSelectorSpec, SecretSpec};
