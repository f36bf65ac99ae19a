pub mod config;
pub mod error;
pub mod event;
pub mod expression;
pub mod gate;
pub mod traits;
pub mod transform;
pub mod tree;
pub mod types;

pub use config::AppConfig;
pub use error::{GateflowError, Result};
pub use event::EventBus;
pub use types::*;
