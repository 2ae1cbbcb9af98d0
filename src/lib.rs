#[cfg(feature = "controller")]
pub mod controller;
