//! Task module
//!
//! This module contains the task record and its status state machine.

mod model;

pub use model::*;
