//! Range math: splitting objects into byte ranges for sliced downloads.

mod range;

pub use range::{component_count, plan_components, plan_segments, Segment};
