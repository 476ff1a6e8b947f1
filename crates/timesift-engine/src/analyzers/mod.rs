pub mod domain;
pub mod tagger;

use crate::analyzer::Analyzer;
use crate::registry::AnalyzerRegistry;

/// Register every analyzer shipped with the engine.
pub fn register_builtin(registry: &mut AnalyzerRegistry) {
    registry.register(domain::descriptor(), |_| {
        Ok(Box::new(domain::DomainAnalyzer::new()?) as Box<dyn Analyzer>)
    });
    registry.register(tagger::descriptor(), |args| {
        Ok(Box::new(tagger::TaggerAnalyzer::from_args(args)?) as Box<dyn Analyzer>)
    });
}

/// Registry holding only the built-in analyzers.
pub fn builtin_registry() -> AnalyzerRegistry {
    let mut registry = AnalyzerRegistry::new();
    register_builtin(&mut registry);
    registry
}
