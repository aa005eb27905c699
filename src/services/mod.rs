//! Import pipeline services
//!
//! File -> `parser` -> `normalizer` -> `batch_processor` -> session endpoint
//! (`backend`), orchestrated by `session_controller`.

pub mod backend;
pub mod batch_processor;
pub mod normalizer;
pub mod parser;
pub mod session_controller;
