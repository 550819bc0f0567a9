//! Document conversion: where sources come from, how the external tool is
//! invoked, and the pipeline the executor runs for each task.

pub mod converter;
pub mod pipeline;
pub mod source;

pub use converter::{CommandConverter, ConversionInvoker};
pub use pipeline::ConversionPipeline;
pub use source::{DocumentSource, HttpFetcher, LocalFetcher, SameOriginRule, SourceFetcher, SourceResolver};
