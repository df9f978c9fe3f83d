//! Application Services
//!
//! - `TelemetryPipeline`: normalize, classify, and fan out broker messages

mod pipeline;

pub use pipeline::{ProcessOutcome, TelemetryPipeline};
