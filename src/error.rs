use derive_more::From;
use k8s_openapi::serde_json;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    /// The cluster's discovery endpoints could not be read
    Discovery(String),

    /// An object is missing one of the fields that make up its identity
    MissingIdentity(&'static str),

    /// Custom error message
    Custom(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Json(e) => write!(fmt, "json: {e}"),
            Self::Kube(e) => write!(fmt, "kube: {e}"),
            Self::Infer(e) => write!(fmt, "kubeconfig: {e}"),
            Self::Discovery(msg) => write!(fmt, "discovery failed: {msg}"),
            Self::MissingIdentity(field) => write!(fmt, "object has no {field}"),
            Self::Custom(msg) => write!(fmt, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}
