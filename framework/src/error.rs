use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Invalid filter: {0}")]
    BadFilter(#[from] gantry_filter::Error),

    #[error("A service must provide at least one specification")]
    NoSpecification,

    #[error("Scope violation: {0}")]
    ScopeViolation(&'static str),

    #[error("Unknown bundle: {0}")]
    UnknownBundle(u64),

    #[error("Bundle lifecycle error: {0}")]
    BundleLifecycle(String),

    #[error("The framework has been stopped")]
    FrameworkStopped,
}
