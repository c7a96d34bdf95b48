//! Core types shared by the stream drivers.

pub mod demand;

pub use demand::{Demand, UNBOUNDED, add_cap, sub_floor, validate_request};
