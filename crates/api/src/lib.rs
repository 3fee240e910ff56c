//! Admin HTTP surface and the worker binary's wiring.

pub mod app;
pub mod echo;
pub mod middleware;
