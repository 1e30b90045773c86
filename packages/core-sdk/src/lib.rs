pub mod catalog;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod prompt;
pub mod registry;
pub mod server;
pub mod telemetry;

/**
 * \brief Commonly used modules and types, re-exported for the binaries.
 */
pub mod prelude {
    pub use crate::catalog;
    pub use crate::chat;
    pub use crate::config::{AppConfig, DefaultCredentials};
    pub use crate::db;
    pub use crate::error::{ChatError, ChatResult};
    pub use crate::llm;
    pub use crate::models;
    pub use crate::registry;
    pub use crate::server;
    pub use crate::telemetry;
}
