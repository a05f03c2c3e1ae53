//! CLI command modules

pub mod keygen;
pub mod run;
pub mod simulate;

pub use keygen::{execute_keygen_command, KeygenArgs};
pub use run::{execute_run_command, RunArgs};
pub use simulate::{execute_simulate_command, SimulateArgs};
