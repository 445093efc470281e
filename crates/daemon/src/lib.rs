//! workq daemon - composition root
//!
//! Wires the backends into the core registry and hosts the admin tooling.

pub mod factory;
pub mod logging;
pub mod settings;

pub use factory::DefaultBackendFactory;
pub use logging::{init_logging, LogFormat};
pub use settings::DaemonConfig;
