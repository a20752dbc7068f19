#![deny(bad_style)]
#![deny(future_incompatible)]
#![deny(nonstandard_style)]
#![deny(rust_2018_idioms)]
#[macro_use]
extern crate slog;

pub mod gate;
pub mod primitives;
