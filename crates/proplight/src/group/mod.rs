//! Light group arithmetic: combining member states into one group state and
//! splitting group commands back into member commands.

pub mod aggregate;
pub mod color;
pub mod disaggregate;
pub mod proportion;
