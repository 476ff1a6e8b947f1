use std::collections::HashMap;
use std::sync::Arc;

use crate::analyzer::{Analyzer, AnalyzerArgs, AnalyzerDescriptor};
use crate::error::EngineError;

/// Builds one analyzer instance from its keyword arguments.
pub type AnalyzerFactory =
    Arc<dyn Fn(&AnalyzerArgs) -> Result<Box<dyn Analyzer>, EngineError> + Send + Sync>;

struct AnalyzerEntry {
    descriptor: AnalyzerDescriptor,
    factory: AnalyzerFactory,
}

/// Registry of available analyzers, keyed by name.
pub struct AnalyzerRegistry {
    analyzers: HashMap<String, AnalyzerEntry>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self {
            analyzers: HashMap::new(),
        }
    }

    /// Register an analyzer, replacing any previous one with the same name.
    pub fn register<F>(&mut self, descriptor: AnalyzerDescriptor, factory: F)
    where
        F: Fn(&AnalyzerArgs) -> Result<Box<dyn Analyzer>, EngineError> + Send + Sync + 'static,
    {
        let name = descriptor.name.clone();
        self.analyzers.insert(
            name,
            AnalyzerEntry {
                descriptor,
                factory: Arc::new(factory),
            },
        );
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.analyzers.remove(name).is_some()
    }

    pub fn descriptor(&self, name: &str) -> Option<&AnalyzerDescriptor> {
        self.analyzers.get(name).map(|e| &e.descriptor)
    }

    pub fn factory(&self, name: &str) -> Option<AnalyzerFactory> {
        self.analyzers.get(name).map(|e| Arc::clone(&e.factory))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.analyzers.contains_key(name)
    }

    /// Descriptors sorted by name.
    pub fn descriptors(&self) -> Vec<&AnalyzerDescriptor> {
        let mut all: Vec<&AnalyzerDescriptor> = self.analyzers.values().map(|e| &e.descriptor).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn names(&self) -> Vec<String> {
        self.descriptors().into_iter().map(|d| d.name.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.analyzers.len()
    }
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalyzerKwargs;
    use async_trait::async_trait;

    struct Dummy;

    #[async_trait]
    impl Analyzer for Dummy {}

    fn register(registry: &mut AnalyzerRegistry, name: &str) {
        registry.register(AnalyzerDescriptor::new(name, name.to_uppercase()), |_| {
            Ok(Box::new(Dummy) as Box<dyn Analyzer>)
        });
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = AnalyzerRegistry::new();
        register(&mut registry, "domain");

        assert!(registry.contains("domain"));
        assert!(!registry.contains("tagger"));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.descriptor("domain").unwrap().display_name, "DOMAIN");
        let factory = registry.factory("domain").unwrap();
        assert!(factory(&AnalyzerArgs::new()).is_ok());
    }

    #[test]
    fn unregister() {
        let mut registry = AnalyzerRegistry::new();
        register(&mut registry, "domain");
        assert!(registry.unregister("domain"));
        assert!(!registry.contains("domain"));
        assert!(!registry.unregister("domain"));
    }

    #[test]
    fn names_sorted() {
        let mut registry = AnalyzerRegistry::new();
        for name in ["tagger", "browser", "domain"] {
            register(&mut registry, name);
        }
        assert_eq!(registry.names(), vec!["browser", "domain", "tagger"]);
    }

    #[test]
    fn re_registering_replaces_descriptor() {
        let mut registry = AnalyzerRegistry::new();
        register(&mut registry, "tagger");
        let many = AnalyzerKwargs::Multiple(vec![AnalyzerArgs::new(), AnalyzerArgs::new()]);
        registry.register(
            AnalyzerDescriptor::new("tagger", "Tagger").with_kwargs(many),
            |_| Ok(Box::new(Dummy) as Box<dyn Analyzer>),
        );
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.descriptor("tagger").unwrap().get_kwargs().instances().len(), 2);
    }
}
