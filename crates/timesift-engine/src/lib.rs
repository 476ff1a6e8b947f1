pub mod analyzer;
pub mod analyzers;
pub mod error;
pub mod event;
pub mod registry;
pub mod runner;
pub mod sketch;

pub use analyzer::{
    Analyzer, AnalyzerArgs, AnalyzerConfig, AnalyzerContext, AnalyzerDescriptor, AnalyzerInstance,
    AnalyzerKwargs, EventQuery, EventStream, FlushPolicy,
};
pub use error::EngineError;
pub use event::Event;
pub use registry::AnalyzerRegistry;
pub use runner::{AnalysisRunner, InstanceOutcome};
pub use sketch::{Sketch, ViewQueryGate};

#[cfg(test)]
mod testing;
