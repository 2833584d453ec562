#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Invalid filter pattern: {source}")]
    Pattern {
        #[from]
        source: regex::Error,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Yaml error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Unknown cloud provider: {0}")]
    UnknownProvider(String),

    #[error("Cloud source error: {source}")]
    Cloud {
        #[from]
        source: anyhow::Error,
    },
}

impl Error {
    /// Condition reason identifying the startup stage that failed. Runtime
    /// transient errors never surface through this path.
    pub fn startup_reason(&self) -> &'static str {
        match self {
            Error::Pattern { .. } => "InvalidFilterPattern",
            Error::Tls(_) => "TlsConfigError",
            Error::UnknownProvider(_) => "UnknownCloudProvider",
            Error::UserInput(_) => "InvalidSpec",
            Error::Kube { .. } => "KubeApiError",
            Error::Io { .. } => "SourceIoError",
            Error::Cloud { .. } => "CloudSourceError",
            Error::Json { .. } | Error::Yaml { .. } => "SerializationError",
        }
    }
}
