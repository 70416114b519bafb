//! Actions that ship with the orchestrator.
//!
//! Concrete cloud operations live outside this crate; these cover the three
//! capability shapes and are what the CLI registers by default.

mod delay;
mod noop;
mod set_tags;

use crate::action::ActionDescriptor;

pub fn descriptors() -> Vec<ActionDescriptor> {
    vec![noop::descriptor(), delay::descriptor(), set_tags::descriptor()]
}
