//! Scale line-protocol discovery: capture-driven inference of
//! [`ProtocolTemplate`]s, plus the content-addressed store that holds
//! them once published.

mod engine;
mod template;

pub use engine::{ConfidenceBreakdown, DiscoveryEngine, DiscoveryError, DiscoveryOutcome, DiscoverySession};
pub use template::{Encoding, FieldKind, FieldSpec, ProtocolTemplate, TemplateError, TemplateRepository};
