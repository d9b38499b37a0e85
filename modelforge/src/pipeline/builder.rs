//! Pipeline builder with validation.

use super::PipelineGraph;
use crate::errors::{codes, ContractErrorInfo, CycleDetectedError, PipelineValidationError};
use crate::stages::StageDescriptor;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Builder for creating validated pipelines.
///
/// Stages may be added in any order; dependency checks run in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    /// The pipeline name.
    name: String,
    /// The stage descriptors.
    stages: HashMap<String, StageDescriptor>,
    /// Insertion order for stages.
    stage_order: Vec<String>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: HashMap::new(),
            stage_order: Vec::new(),
        }
    }

    /// Adds a stage to the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor is inconsistent, depends on
    /// itself, or reuses a stage name.
    pub fn stage(mut self, descriptor: StageDescriptor) -> Result<Self, PipelineValidationError> {
        self.add_stage(descriptor)?;
        Ok(self)
    }

    /// Adds a stage in place.
    ///
    /// # Errors
    ///
    /// See [`stage`](Self::stage).
    pub fn add_stage(&mut self, descriptor: StageDescriptor) -> Result<(), PipelineValidationError> {
        descriptor.validate()?;

        if descriptor.dependencies.contains(&descriptor.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' cannot depend on itself",
                descriptor.name
            ))
            .with_stages(vec![descriptor.name.clone()])
            .with_error_info(
                ContractErrorInfo::new(codes::SELF_DEP, format!("Stage '{}' depends on itself", descriptor.name))
                    .with_fix_hint("Remove the stage from its own dependency list."),
            ));
        }

        if self.stages.contains_key(&descriptor.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' is defined twice",
                descriptor.name
            ))
            .with_stages(vec![descriptor.name.clone()])
            .with_error_info(
                ContractErrorInfo::new(codes::CONFLICT, format!("Duplicate stage name '{}'", descriptor.name))
                    .with_fix_hint("Rename one of the stages."),
            ));
        }

        self.stage_order.push(descriptor.name.clone());
        self.stages.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no stages, a dependency is
    /// unknown, the graph has a cycle, two stages produce the same role, or
    /// an input role is not published by a transitive dependency.
    pub fn build(self) -> Result<PipelineGraph, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages").with_error_info(
                ContractErrorInfo::new(codes::EMPTY, "Cannot build an empty pipeline")
                    .with_fix_hint("Add at least one stage to the pipeline before building."),
            ));
        }

        self.check_dependencies_exist()?;
        self.detect_cycles()?;
        self.check_role_producers()?;
        self.check_inputs_bound()?;

        Ok(PipelineGraph::new(self.name, self.stages, &self.stage_order))
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    fn ordered(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.stage_order.iter().filter_map(|name| self.stages.get(name))
    }

    fn check_dependencies_exist(&self) -> Result<(), PipelineValidationError> {
        for descriptor in self.ordered() {
            for dep in &descriptor.dependencies {
                if !self.stages.contains_key(dep) {
                    return Err(PipelineValidationError::new(format!(
                        "Stage '{}' depends on unknown stage '{}'",
                        descriptor.name, dep
                    ))
                    .with_stages(vec![descriptor.name.clone(), dep.clone()])
                    .with_error_info(
                        ContractErrorInfo::new(codes::MISSING_DEP, format!("Dependency '{dep}' not found"))
                            .with_fix_hint("Add the dependency stage to the pipeline."),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Detects cycles in the dependency graph.
    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for name in &self.stage_order {
            if !visited.contains(name) {
                if let Some(cycle) = self.dfs_cycle(name, &mut visited, &mut rec_stack, &mut path) {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(descriptor) = self.stages.get(node) {
            for dep in &descriptor.dependencies {
                if !visited.contains(dep) {
                    if let Some(cycle) = self.dfs_cycle(dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(dep) {
                    let start = path.iter().position(|n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].to_vec();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }

    fn check_role_producers(&self) -> Result<(), PipelineValidationError> {
        let mut producers: HashMap<&str, &str> = HashMap::new();
        for descriptor in self.ordered() {
            for role in descriptor.produced_roles() {
                if let Some(existing) = producers.insert(role, &descriptor.name) {
                    return Err(PipelineValidationError::new(format!(
                        "Role '{role}' is produced by both '{existing}' and '{}'",
                        descriptor.name
                    ))
                    .with_stages(vec![existing.to_string(), descriptor.name.clone()])
                    .with_error_info(
                        ContractErrorInfo::new(codes::ROLE_CONFLICT, format!("Role '{role}' has two producers"))
                            .with_fix_hint("Rename one role, or mark the downstream one as a passthrough.")
                            .with_context_entry("role", role),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_inputs_bound(&self) -> Result<(), PipelineValidationError> {
        for descriptor in self.ordered() {
            let ancestors = self.ancestors(&descriptor.name);
            for input in &descriptor.inputs {
                let bound = ancestors.contains(input.stage.as_str())
                    && self.stages.get(&input.stage).is_some_and(|up| up.publishes(&input.role));
                if !bound {
                    return Err(PipelineValidationError::new(format!(
                        "Stage '{}' consumes '{}', which no upstream stage publishes",
                        descriptor.name,
                        input.key()
                    ))
                    .with_stages(vec![descriptor.name.clone(), input.stage.clone()])
                    .with_error_info(
                        ContractErrorInfo::new(codes::UNBOUND_INPUT, format!("Input '{}' is unbound", input.key()))
                            .with_fix_hint("Depend on the producing stage and make sure it declares the role.")
                            .with_context_entry("stage", descriptor.name.clone()),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Transitive dependencies of `stage`.
    fn ancestors(&self, stage: &str) -> BTreeSet<&str> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self
            .stages
            .get(stage)
            .map(|d| d.dependencies.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                if let Some(d) = self.stages.get(next) {
                    stack.extend(d.dependencies.iter().map(String::as_str));
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::roles;
    use crate::stages::{CommandKind, CommandSpec, InputRole, OutputRole};

    fn stage(name: &str) -> StageDescriptor {
        StageDescriptor::new(name).with_command(CommandSpec::new("run", CommandKind::Execute, "true"))
    }

    fn code(err: &PipelineValidationError) -> &str {
        err.code().unwrap_or_default()
    }

    #[test]
    fn test_builder_creation() {
        let builder = PipelineBuilder::new("test");
        assert_eq!(builder.name(), "test");
        assert_eq!(builder.stage_count(), 0);
    }

    #[test]
    fn test_builder_empty_build() {
        let err = PipelineBuilder::new("test").build().unwrap_err();
        assert_eq!(code(&err), codes::EMPTY);
    }

    #[test]
    fn test_builder_missing_dependency() {
        let err = PipelineBuilder::new("test")
            .stage(stage("b").with_dependency("a"))
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(code(&err), codes::MISSING_DEP);
        assert_eq!(err.stages, vec!["b", "a"]);
    }

    #[test]
    fn test_builder_self_dependency() {
        let err = PipelineBuilder::new("test").stage(stage("a").with_dependency("a")).unwrap_err();
        assert_eq!(code(&err), codes::SELF_DEP);
    }

    #[test]
    fn test_builder_duplicate_stage() {
        let err = PipelineBuilder::new("test")
            .stage(stage("a"))
            .unwrap()
            .stage(stage("a"))
            .unwrap_err();
        assert_eq!(code(&err), codes::CONFLICT);
    }

    #[test]
    fn test_builder_cycle_detection() {
        let err = PipelineBuilder::new("test")
            .stage(stage("a").with_dependency("c"))
            .unwrap()
            .stage(stage("b").with_dependency("a"))
            .unwrap()
            .stage(stage("c").with_dependency("b"))
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(code(&err), codes::CYCLE);
        assert_eq!(err.stages.first(), err.stages.last());
        assert!(err.message.contains("->"));
    }

    #[test]
    fn test_builder_role_conflict() {
        let err = PipelineBuilder::new("test")
            .stage(stage("a").with_output(OutputRole::new(roles::MODEL)))
            .unwrap()
            .stage(stage("b").with_output(OutputRole::new(roles::MODEL)))
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(code(&err), codes::ROLE_CONFLICT);
    }

    #[test]
    fn test_passthrough_is_not_a_second_producer() {
        let graph = PipelineBuilder::new("test")
            .stage(stage("a").with_output(OutputRole::new(roles::TEST_VECTORS)))
            .unwrap()
            .stage(
                stage("b")
                    .with_input(InputRole::new("a", roles::TEST_VECTORS))
                    .with_output(OutputRole::new(roles::TEST_VECTORS).passthrough()),
            )
            .unwrap()
            .stage(stage("c").with_input(InputRole::new("b", roles::TEST_VECTORS)))
            .unwrap()
            .build();
        assert!(graph.is_ok());
    }

    #[test]
    fn test_builder_unbound_input() {
        let err = PipelineBuilder::new("test")
            .stage(stage("a").with_output(OutputRole::new(roles::MODEL)))
            .unwrap()
            .stage(stage("b").with_input(InputRole::new("a", roles::GENERATED_SOURCE)))
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(code(&err), codes::UNBOUND_INPUT);
        assert!(err.message.contains("a.generated_source"));
    }

    #[test]
    fn test_builder_build_success_in_any_order() {
        let graph = PipelineBuilder::new("test")
            .stage(stage("b").with_dependency("a"))
            .unwrap()
            .stage(stage("a"))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(graph.name(), "test");
        assert_eq!(graph.execution_order(), ["a", "b"]);
    }
}
