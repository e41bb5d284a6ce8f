mod clean;
mod probe;
mod sweep;

pub use clean::run_clean_temp;
pub use probe::run_probe;
pub use sweep::run_sweep_orphans;
