//! CLI command implementations.

mod config;
mod export;
mod generate;
mod resume;
mod show;
mod start;
mod status;

pub use config::run_config;
pub use export::run_export;
pub use generate::run_generate;
pub use resume::run_resume;
pub use show::run_show;
pub use start::run_start;
pub use status::run_status;
