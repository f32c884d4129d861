//! Code generation engine: provider calls, sandboxed build/test and
//! diagnostics extraction.

pub mod diagnostics;
pub mod engine;
pub mod fakes;
pub mod prompt;
pub mod provider;
pub mod retry;
pub mod toolchain;

pub use engine::{EngineConfig, GenerationEngine, TokenPricing};
pub use provider::{
    parse_file_blocks, CodeGenerator, GenerationError, GenerationOutput, HttpCodeGenerator,
    HttpGeneratorConfig, TokenUsage,
};
pub use retry::{CircuitBreaker, RetryConfig};
pub use toolchain::{ToolchainProfile, OWNER_LABEL};
