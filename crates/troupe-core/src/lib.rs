pub mod cancel;
pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use cancel::{CancelReason, CancelSignal};
pub use config::WorkflowConfig;
pub use error::{Result, TroupeError};
pub use event::EventBus;
pub use types::*;
