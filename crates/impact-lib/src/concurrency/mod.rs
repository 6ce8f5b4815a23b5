//! Concurrency control for outbound collaborator calls
//!
//! Every component that issues many calls to a single rate-limited API goes
//! through a [`ConcurrencyController`].

mod controller;

#[cfg(test)]
mod tests;

pub use controller::ConcurrencyController;
