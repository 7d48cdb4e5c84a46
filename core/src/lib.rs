pub mod command;
pub mod error;
pub mod model;
pub mod reply;
