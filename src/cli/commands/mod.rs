pub mod config;
pub mod diagnose;
pub mod run;

pub use config::ConfigCommand;
pub use diagnose::DiagnoseCommand;
pub use run::RunCommand;
