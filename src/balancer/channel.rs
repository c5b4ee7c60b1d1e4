//! 负载均衡的 gRPC 通道
//!
//! `BalancedChannel` 实现 `tower::Service`，可直接作为 tonic 生成客户端的底层通道。
//! 每次调用通过当前 picker 选择连接，并把响应体包装为 `DoneBody`，
//! 在响应流结束时把调用结果回报给选择器。

use std::any::Any;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::HeaderMap;
use http_body::{Body as HttpBody, Frame, SizeHint};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tonic::body::Body;
use tonic::{Code, Status};
use tower::{Service, ServiceExt};
use tracing::warn;

use super::picker::Picked;
use super::pool::ConnectionPool;
use crate::error::BoxError;
use crate::resolver::{Resolver, Target};
use crate::selector::{DoneFunc, DoneInfo, PickInfo, Trailer};

const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// 负载均衡的 gRPC 通道
#[derive(Clone)]
pub struct BalancedChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    target: Target,
    pool: Arc<ConnectionPool>,
    resolver: Mutex<Option<Box<dyn Resolver>>>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

impl BalancedChannel {
    pub(crate) fn new(target: Target, pool: Arc<ConnectionPool>, resolver: Box<dyn Resolver>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                target,
                pool,
                resolver: Mutex::new(Some(resolver)),
            }),
        }
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    /// 当前就绪连接数
    pub fn ready_count(&self) -> usize {
        self.inner.pool.current_picker().len()
    }

    /// 关闭解析器并释放所有连接，可重复调用
    pub async fn close(&self) {
        if let Some(resolver) = self.inner.resolver.lock().await.take() {
            resolver.close().await;
        }
        self.inner.pool.close().await;
    }
}

impl fmt::Debug for BalancedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BalancedChannel")
            .field("target", &self.inner.target)
            .field("ready", &self.ready_count())
            .finish()
    }
}

impl Service<http::Request<Body>> for BalancedChannel {
    type Response = http::Response<DoneBody<Body>>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        let pool = self.inner.pool.clone();
        Box::pin(async move {
            let info = pick_info(&request);
            let Picked {
                node,
                mut channel,
                done,
            } = pool
                .pick(&info)
                .await
                .map_err(|e| Box::new(Status::from(e)) as BoxError)?;

            let sent = Arc::new(AtomicU64::new(0));
            let request = request.map(|body| {
                Body::new(CountingBody {
                    inner: Box::pin(body),
                    sent: sent.clone(),
                })
            });

            let result = match ServiceExt::<http::Request<Body>>::ready(&mut channel).await {
                Ok(svc) => svc.call(request).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(response) => {
                    let (parts, body) = response.into_parts();
                    let body = DoneBody::new(body, done, sent, parts.headers.clone());
                    Ok(http::Response::from_parts(parts, body))
                }
                Err(e) => {
                    warn!(address = %node.address(), method = %info.method, error = %e, "call failed");
                    pool.report_failure(node.address()).await;
                    if let Some(done) = done {
                        done(DoneInfo {
                            error: Some(Status::unavailable(e.to_string())),
                            bytes_sent: sent.load(Ordering::Relaxed),
                            bytes_received: 0,
                            reply_md: Trailer::default(),
                        });
                    }
                    Err(e.into())
                }
            }
        })
    }
}

fn pick_info<B>(request: &http::Request<B>) -> PickInfo {
    let deadline = request
        .headers()
        .get(GRPC_TIMEOUT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_grpc_timeout)
        .map(|timeout| Instant::now() + timeout);
    PickInfo {
        method: request.uri().path().to_string(),
        deadline,
        metadata: request.headers().clone(),
    }
}

/// 解析 `grpc-timeout` 头：最多 8 位数字加单位（H M S m u n）
pub(crate) fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

/// 统计请求体发送字节数
struct CountingBody {
    inner: Pin<Box<Body>>,
    sent: Arc<AtomicU64>,
}

impl HttpBody for CountingBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let frame = ready!(self.inner.as_mut().poll_frame(cx));
        if let Some(Ok(frame)) = &frame {
            if let Some(data) = frame.data_ref() {
                self.sent.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// 响应体包装：统计接收字节、捕获 trailer，并在结束时调用一次完成回调
pub struct DoneBody<B> {
    inner: Pin<Box<B>>,
    done: Option<DoneFunc>,
    sent: Arc<AtomicU64>,
    received: u64,
    headers: HeaderMap,
}

impl<B> DoneBody<B> {
    fn new(inner: B, done: Option<DoneFunc>, sent: Arc<AtomicU64>, headers: HeaderMap) -> Self {
        Self {
            inner: Box::pin(inner),
            done,
            sent,
            received: 0,
            headers,
        }
    }

    fn finish(&mut self, error: Option<Status>, trailers: HeaderMap) {
        if let Some(done) = self.done.take() {
            done(DoneInfo {
                error,
                bytes_sent: self.sent.load(Ordering::Relaxed),
                bytes_received: self.received,
                reply_md: Trailer::new(trailers),
            });
        }
    }
}

/// 从 `grpc-status` 中取出非 OK 状态
fn failed_status(headers: &HeaderMap) -> Option<Status> {
    Status::from_header_map(headers).filter(|status| status.code() != Code::Ok)
}

impl<B> HttpBody for DoneBody<B>
where
    B: HttpBody<Data = Bytes>,
    B::Error: fmt::Display + 'static,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match ready!(this.inner.as_mut().poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.received += data.len() as u64;
                } else if let Some(trailers) = frame.trailers_ref() {
                    this.finish(failed_status(trailers), trailers.clone());
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(err)) => {
                let status = match (&err as &dyn Any).downcast_ref::<Status>() {
                    Some(status) => Status::new(status.code(), status.message()),
                    None => Status::unknown(err.to_string()),
                };
                this.finish(Some(status), HeaderMap::new());
                Poll::Ready(Some(Err(err)))
            }
            None => {
                // trailers-only 响应的状态在响应头中
                let headers = std::mem::take(&mut this.headers);
                this.finish(failed_status(&headers), headers);
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for DoneBody<B> {
    fn drop(&mut self) {
        if self.done.is_none() {
            return;
        }
        let error = match Status::from_header_map(&self.headers) {
            Some(status) if status.code() == Code::Ok => None,
            Some(status) => Some(status),
            None => Some(Status::cancelled("response body dropped before completion")),
        };
        let headers = std::mem::take(&mut self.headers);
        self.finish(error, headers);
    }
}
