//! Mining algorithm support.
//!
//! The pool is RandomX-only (`rx/0`); there is no multi-algorithm
//! switchboard.

pub mod randomx;
