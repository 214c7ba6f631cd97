//! Prompt templates for speech-conditioned language model prompting.
//!
//! A template is an ordered list of literal text and field references.
//! [`TemplateStore`] holds one template per task; [`SegmentResolver`] turns a
//! template plus one [`slm_core::Example`] into concrete embedding segments.

mod resolver;
mod store;
mod template;

pub use resolver::{ResolvedSegment, ResolvedSegmentList, SegmentResolver, SegmentRole, SegmentSource};
pub use store::TemplateStore;
pub use template::{Segment, Template};
