// This is free and unencumbered software released into the public domain.

#![forbid(unsafe_code)]

#[macro_use]
mod macros;

pub mod cli;
pub mod shared;
