//! Phase control: moves runs through the pipeline one human decision at a time.

mod controller;
mod input;

pub use controller::PhaseController;
pub use input::build_worker_input;
