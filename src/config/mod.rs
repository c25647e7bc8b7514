pub mod error;
pub mod handle;
pub mod types;

pub use error::{ConfigError, ConfigResult};
pub use handle::ConfigHandle;
pub use types::{
    BrokerConfig, PrivilegeEscalationConfig, RemoteAccessConfig, SecurityConfig, ServerConfig,
    TransferConfig,
};
