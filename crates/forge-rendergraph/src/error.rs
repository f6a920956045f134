use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderGraphError {
    #[error("cyclic dependency in render graph involving pass \"{pass}\"")]
    CyclicDependency { pass: String },

    #[error("backend error while realizing resource \"{resource}\": {source}")]
    Backend {
        resource: String,
        #[source]
        source: forge_backend::BackendError,
    },
}

pub type Result<T> = std::result::Result<T, RenderGraphError>;
