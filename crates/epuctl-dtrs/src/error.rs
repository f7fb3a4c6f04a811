use thiserror::Error;

#[derive(Debug, Error)]
pub enum DtrsError {
    #[error("deployable type '{dt_name}' not found for caller '{caller}'")]
    DtNotFound { caller: String, dt_name: String },

    #[error("deployable type '{dt_name}' has no mapping for site '{site}'")]
    NotMappedForSite { dt_name: String, site: String },

    #[error("site '{0}' is not configured")]
    SiteNotFound(String),

    #[error("no credentials for caller '{caller}' at site '{site}'")]
    CredentialsNotFound { caller: String, site: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },
}
