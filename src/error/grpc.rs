//! gRPC 错误处理
//!
//! 提供 Error 到 tonic::Status 的转换，pick 失败时生成的客户端据此拿到正确的状态码

use super::Error;
use tonic::Status;

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::NoConnectionAvailable
            | Error::NoAvailableNode
            | Error::Selector(_)
            | Error::DiscoveryTimeout { .. }
            | Error::Watch(_)
            | Error::Transport(_) => Status::unavailable(message),
            Error::DeadlineExceeded | Error::Timeout { .. } => Status::deadline_exceeded(message),
            Error::Cancelled => Status::cancelled(message),
            Error::InvalidTarget(_) | Error::InvalidEndpoint(_) | Error::UnknownScheme(_) => {
                Status::invalid_argument(message)
            }
            _ => Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn pick_errors_map_to_retryable_codes() {
        assert_eq!(Status::from(Error::NoConnectionAvailable).code(), Code::Unavailable);
        assert_eq!(Status::from(Error::NoAvailableNode).code(), Code::Unavailable);
        assert_eq!(Status::from(Error::DeadlineExceeded).code(), Code::DeadlineExceeded);
        assert_eq!(Status::from(Error::Cancelled).code(), Code::Cancelled);
    }

    #[test]
    fn other_errors_are_internal() {
        let status = Status::from(Error::Config("missing name".into()));
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "config error: missing name");
    }
}
