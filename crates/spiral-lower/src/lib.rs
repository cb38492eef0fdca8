//! EIR to LIR lowering and LIR structural verification.

pub mod lower;
pub mod verify;

pub use lower::{lower_program, lower_program_with, LowerOptions};
pub use verify::verify_block_node;
