pub mod config;
pub mod container;
pub mod controller;
pub mod queue;
pub mod remote;
pub mod script;
pub mod secrets;

#[cfg(test)]
pub(crate) mod testing;
