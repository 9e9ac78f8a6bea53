pub mod config;
pub mod errors;
pub mod plugins;
pub mod project;
pub mod remote;
pub mod reporter;
pub mod scaffold;
pub mod session;
pub mod specs;
pub mod state;
pub mod watch;

pub use config::{ConfigSnapshot, ResolveOptions, TestingType};
pub use errors::ProjectError;
pub use project::{Collaborators, LifecycleState, OpenOptions, Project, SessionHandle};

/// Initialize tracing for embedders that don't bring their own
/// subscriber. Respects `RUST_LOG`; defaults to info-level output for
/// this crate only.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "specdeck=info".into()),
    );
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
