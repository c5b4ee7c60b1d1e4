//! 进程终止信号

use std::fmt;
use std::io;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// 触发优雅关闭的信号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGQUIT
    Quit,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

/// 立即安装信号处理器，返回在任一信号到达时完成的 future
///
/// 列表为空时返回的 future 永不完成。
#[cfg(unix)]
pub fn listen(signals: &[ShutdownSignal]) -> io::Result<BoxFuture<'static, ShutdownSignal>> {
    use tokio::signal::unix::{SignalKind, signal};

    if signals.is_empty() {
        return Ok(futures::future::pending().boxed());
    }

    let mut waits = Vec::with_capacity(signals.len());
    for &sig in signals {
        let kind = match sig {
            ShutdownSignal::Interrupt => SignalKind::interrupt(),
            ShutdownSignal::Terminate => SignalKind::terminate(),
            ShutdownSignal::Quit => SignalKind::quit(),
        };
        let mut stream = signal(kind)?;
        waits.push(
            async move {
                stream.recv().await;
                sig
            }
            .boxed(),
        );
    }

    Ok(async move { futures::future::select_all(waits).await.0 }.boxed())
}

/// 非 unix 平台只支持 Ctrl+C
#[cfg(not(unix))]
pub fn listen(signals: &[ShutdownSignal]) -> io::Result<BoxFuture<'static, ShutdownSignal>> {
    if signals.is_empty() {
        return Ok(futures::future::pending().boxed());
    }
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownSignal::Interrupt,
            Err(_) => futures::future::pending().await,
        }
    }
    .boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn display_uses_posix_names() {
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
        assert_eq!(ShutdownSignal::Quit.to_string(), "SIGQUIT");
    }

    #[tokio::test]
    async fn empty_list_never_fires() {
        let signal = listen(&[]).unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(20), signal).await.is_err());
    }
}
