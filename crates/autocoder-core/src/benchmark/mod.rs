//! Benchmark mode: replay a repair-task dataset and aggregate the results.

pub mod counters;
pub mod dataset;
pub mod report;
pub mod runner;

pub use counters::{BenchmarkCounters, CounterSnapshot};
pub use dataset::{
    load_dataset, load_predictions, parse_dataset, parse_predictions, BenchmarkTask, DatasetFilter,
    Prediction,
};
pub use report::{BenchmarkInstanceResult, BenchmarkReport, InstanceError, InstanceErrorKind};
pub use runner::{BenchmarkOptions, BenchmarkRunner};
