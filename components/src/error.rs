use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown component factory: {0}")]
    UnknownFactory(String),

    #[error("Unknown component instance: {0}")]
    UnknownInstance(String),

    #[error("Component name already in use: {0}")]
    DuplicateName(String),

    #[error("Component factory already registered: {0}")]
    DuplicateFactory(String),

    #[error("Handler configuration error: {0}")]
    HandlerConfiguration(String),

    #[error("Invalid component state: {0}")]
    InvalidState(String),

    #[error("The component core service is not available")]
    CoreUnavailable,

    #[error("Invalid requirement: {0}")]
    InvalidRequirement(String),

    #[error(transparent)]
    Filter(#[from] gantry_filter::Error),

    #[error(transparent)]
    Framework(#[from] gantry_framework::Error),
}
