//! dashboard-diffusion: JSONL stream parsing, replay and snapshot formatting
//! for the `diffusion` binary.

pub mod format;
pub mod parser;
pub mod replay;

#[cfg(test)]
mod tests;
