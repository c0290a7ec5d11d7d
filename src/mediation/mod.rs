//! Message mediation: turn unstructured operator text into typed events.
//!
//! One stored message flows through context assembly, the classification
//! collaborator, tolerant parsing, structured side-effects, interpretation
//! persistence, and the confidence-gated notification hand-off. Every
//! failure short of a store error resolves to the fallback note result
//! rather than an error, so posting always succeeds for the operator.

pub mod classifier;
pub mod context;
pub mod parser;
pub mod pipeline;
pub mod types;

pub use classifier::{Classifier, CommandClassifier};
pub use context::SiteSnapshot;
pub use pipeline::Mediator;
pub use types::{EventType, MediationResult};
