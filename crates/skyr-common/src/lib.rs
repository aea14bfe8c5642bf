//! ---
//! skyr_section: "01-core-functionality"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Shared configuration and logging primitives."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
//! Shared primitives for the skyr workspace: the reflector configuration
//! model with its loader and validation, and the tracing bootstrap.

pub mod config;
pub mod logging;

pub use config::{
    AuthConfig, BackendConfig, BackendMode, ConfigError, CorsConfig, DeviceBackendConfig,
    DeviceConfig, EngineConfig, LoadedConfig, LoggingConfig, MqttBackendConfig,
    NetworkBackendConfig, ReflectorConfig, ServerConfig, TlsConfig, DEFAULT_API_PORT,
    DEFAULT_DISCOVERY_PORT, DEFAULT_LOCATION, DEFAULT_MANUFACTURER, DEFAULT_SERVER_NAME,
};
pub use logging::{init_tracing, LogFormat};
