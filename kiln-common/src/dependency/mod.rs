pub mod definition;
pub mod resolver;

pub use definition::{Dependency, DependencyExt, DependencyPhase, DependencyTag};
pub use resolver::{
    DependencyResolver, ResolutionContext, ResolutionStatus, ResolvedDependency, ResolvedPlan,
};
