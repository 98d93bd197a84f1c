use spark_messaging::MessagingError;
use std::io;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.messaging.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.messaging.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.messaging.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.messaging.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.messaging.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.messaging.tcp.shutdown_failed",
    message: "tcp shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.messaging.tcp.configure_failed",
    message: "tcp configure",
};

/// 将 IO 错误映射为消息层错误，附带稳定错误码。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> MessagingError {
    MessagingError::transport(kind.code, kind.message, error)
}

/// 对端已离开时的关闭失败不值得上报。
pub(crate) fn is_disconnect(error: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::NotConnected
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_messaging::ErrorKind;

    #[test]
    fn io_errors_keep_operation_code() {
        let err = map_io_error(CONNECT, io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(err.code(), "spark.messaging.tcp.connect_failed");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("tcp connect"), "文案应包含操作名: {err}");
    }

    #[test]
    fn disconnects_are_recognised() {
        assert!(is_disconnect(&io::Error::from(io::ErrorKind::NotConnected)));
        assert!(!is_disconnect(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
