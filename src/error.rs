use std::fmt;

#[derive(Debug)]
pub enum DirectorError {
    Config(String),
    Transport(tonic::transport::Error),
    Grpc(tonic::Status),
    Stream(String),
}

impl fmt::Display for DirectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectorError::Config(msg) => write!(f, "config error: {}", msg),
            DirectorError::Transport(e) => write!(f, "transport error: {}", e),
            DirectorError::Grpc(status) => {
                write!(f, "grpc error ({}): {}", status.code(), status.message())
            }
            DirectorError::Stream(msg) => write!(f, "stream error: {}", msg),
        }
    }
}

impl std::error::Error for DirectorError {}

impl From<tonic::transport::Error> for DirectorError {
    fn from(e: tonic::transport::Error) -> Self {
        DirectorError::Transport(e)
    }
}

impl From<tonic::Status> for DirectorError {
    fn from(status: tonic::Status) -> Self {
        DirectorError::Grpc(status)
    }
}
