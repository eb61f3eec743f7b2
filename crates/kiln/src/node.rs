//! Build node description

use kiln_runner::{ResourceVector, TaskError};

/// The real work behind a build node, run only on cache miss.
pub type Action = Box<dyn FnOnce() -> Result<(), TaskError> + Send>;

/// One unit of a build: a uid, its dependencies, the outputs it produces
/// under the workspace root, and the action that produces them.
///
/// A node without an action is a pure marker: it completes as soon as its
/// dependencies do (or its cached outputs restore).
pub struct BuildNode {
    pub(crate) uid: String,
    pub(crate) deps: Vec<String>,
    pub(crate) outputs: Vec<String>,
    pub(crate) priority: i64,
    pub(crate) cost: ResourceVector,
    pub(crate) action: Option<Action>,
}

impl BuildNode {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            deps: Vec::new(),
            outputs: Vec::new(),
            priority: 0,
            cost: ResourceVector::new(),
            action: None,
        }
    }

    /// Adds a dependency on another node's uid.
    #[must_use]
    pub fn with_dep(mut self, uid: impl Into<String>) -> Self {
        self.deps.push(uid.into());
        self
    }

    #[must_use]
    pub fn with_deps<I, S>(mut self, uids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps.extend(uids.into_iter().map(Into::into));
        self
    }

    /// Declares an output path relative to the workspace root.
    #[must_use]
    pub fn with_output(mut self, path: impl Into<String>) -> Self {
        self.outputs.push(path.into());
        self
    }

    #[must_use]
    pub fn with_outputs<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Larger values dispatch first among ready nodes.
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Resource amounts the action occupies while running.
    #[must_use]
    pub fn with_cost(mut self, cost: ResourceVector) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_action<F>(mut self, action: F) -> Self
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        self.action = Some(Box::new(action));
        self
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_accumulates_fields() {
        let node = BuildNode::new("compile")
            .with_dep("codegen")
            .with_deps(["proto", "vendor"])
            .with_output("out/lib.a")
            .with_priority(5)
            .with_cost(ResourceVector::new().with("cpu", 2))
            .with_action(|| Ok(()));

        assert_eq!(node.uid(), "compile");
        assert_eq!(node.deps, ["codegen", "proto", "vendor"]);
        assert_eq!(node.outputs, ["out/lib.a"]);
        assert_eq!(node.priority, 5);
        assert_eq!(node.cost.get("cpu"), 2);
        assert!(node.action.is_some());
    }

    #[test]
    fn test_defaults_are_empty() {
        let node = BuildNode::new("leaf");
        assert!(node.deps.is_empty());
        assert!(node.outputs.is_empty());
        assert_eq!(node.priority, 0);
        assert!(node.action.is_none());
    }
}
