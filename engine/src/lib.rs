pub mod catalog;
pub mod clock;
pub mod config;
pub mod episodes;
pub mod facts;
pub mod handler;
pub mod meds;
pub mod resolver;
pub mod sender;
pub mod store;
pub mod totals;

pub use config::EngineConfig;
pub use handler::Engine;
