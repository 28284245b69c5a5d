pub mod check;
pub mod config;
pub mod course;
pub mod daemon;
pub mod publish;
pub mod status;
pub mod trigger;
