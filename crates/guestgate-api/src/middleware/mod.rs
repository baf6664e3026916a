//! HTTP middleware

pub mod admission;
