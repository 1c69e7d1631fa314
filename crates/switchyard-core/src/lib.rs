pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ParseError, Result, SwitchyardError, ValidationError};
pub use event::{Anomaly, EventBus, RunEvent};
pub use types::*;
