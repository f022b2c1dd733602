use {dockyard_common::FromMessage, thiserror::Error};

#[derive(Debug, Error)]
pub enum Error {
    #[error("image unavailable: {0}")]
    ImageUnavailable(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("name in use: {0}")]
    NameInUse(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("runtime error: {0}")]
    TransientRuntime(String),

    #[error("runtime error: {0}")]
    FatalRuntime(String),

    #[error(transparent)]
    Transport(#[from] dockyard_transport::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TransientRuntime(_) => true,
            Error::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::FatalRuntime(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

dockyard_common::impl_context!();

/// Map container-runtime stderr onto the failure taxonomy. The runtimes
/// only speak through their CLIs, so classification is by message.
pub fn classify_runtime_stderr(stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("no such container")
        || lower.contains("no such instance")
        || lower.contains("not found")
        || lower.contains("does not exist")
    {
        Error::NotFound(stderr.trim().to_string())
    } else if lower.contains("already in use")
        || lower.contains("already exists")
        || lower.contains("conflict")
    {
        Error::NameInUse(stderr.trim().to_string())
    } else if lower.contains("no space left")
        || lower.contains("cannot allocate")
        || lower.contains("out of memory")
    {
        Error::ResourceExhausted(stderr.trim().to_string())
    } else if lower.contains("manifest unknown")
        || lower.contains("pull access denied")
        || lower.contains("no such image")
        || lower.contains("image not known")
    {
        Error::ImageUnavailable(stderr.trim().to_string())
    } else if lower.contains("cannot connect")
        || lower.contains("connection refused")
        || lower.contains("is the docker daemon running")
        || lower.contains("temporarily unavailable")
    {
        Error::TransientRuntime(stderr.trim().to_string())
    } else {
        Error::FatalRuntime(stderr.trim().to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn stderr_classification() {
        assert!(matches!(
            classify_runtime_stderr("Error: No such container: dockyard-x"),
            Error::NotFound(_)
        ));
        assert!(matches!(
            classify_runtime_stderr("name \"dockyard-x\" is already in use"),
            Error::NameInUse(_)
        ));
        assert!(matches!(
            classify_runtime_stderr("write /var: no space left on device"),
            Error::ResourceExhausted(_)
        ));
        assert!(matches!(
            classify_runtime_stderr("manifest unknown: ubuntu:nope"),
            Error::ImageUnavailable(_)
        ));
        assert!(matches!(
            classify_runtime_stderr("Cannot connect to the Docker daemon"),
            Error::TransientRuntime(_)
        ));
        assert!(matches!(
            classify_runtime_stderr("something exploded"),
            Error::FatalRuntime(_)
        ));
    }

    #[test]
    fn retryability() {
        assert!(classify_runtime_stderr("connection refused").is_retryable());
        assert!(!classify_runtime_stderr("No such image: x").is_retryable());
    }
}
