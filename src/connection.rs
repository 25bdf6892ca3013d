//! Connection handler
//!
//! Drives one client from accept to teardown: line framing, registration,
//! the reader loop, the writer task and the idle watchdog, and the single
//! cleanup path every termination goes through.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinError;
use tokio::time;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::codec::{ChatCodec, Inbound};
use crate::error::AppError;
use crate::message::ServerMessage;
use crate::server::ServerContext;
use crate::session::Session;
use crate::watchdog::{self, Expiry};

/// How long a terminated session's writer may keep flushing queued lines
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a session ended
#[derive(Debug)]
pub enum Termination {
    /// Peer closed the stream
    PeerClosed,
    /// Reading from the peer failed
    ReadFailed(AppError),
    /// Writer task stopped (peer gone or write error)
    WriteFailed,
    /// No inbound line within the idle window
    IdleTimeout,
    /// Watchdog task panicked or was cancelled
    WatchdogFailed,
    /// Registry or broadcaster is gone
    ServerClosed(AppError),
}

/// Handle one accepted connection until it terminates
///
/// `address` is the peer address string; it becomes the initial identity.
pub async fn handle_connection<S>(
    stream: S,
    address: String,
    ctx: ServerContext,
) -> Result<Termination, AppError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    debug!("New connection from {}", address);

    let (read_half, write_half) = tokio::io::split(stream);
    let mut lines = FramedRead::new(read_half, ChatCodec::new(ctx.config.max_line_length));

    let (mut session, mut writer) = Session::create(write_half, address, ctx.clone());

    if let Err(e) = session.announce_online().await {
        warn!("Could not register {}: {}", session.address(), e);
        let _ = session.send(ServerMessage::from(&e));
        drop(lines);
        drop(session);
        let _ = time::timeout(DRAIN_TIMEOUT, &mut writer).await;
        return Err(e);
    }

    let (pulse, mut watchdog) = watchdog::spawn(ctx.config.idle_timeout());

    // Only the read is raced; a routed command always runs to completion
    let termination = loop {
        let frame = tokio::select! {
            frame = lines.next() => frame,
            expiry = &mut watchdog => break expiry_termination(expiry),
            _ = &mut writer => break Termination::WriteFailed,
        };

        match frame {
            None => break Termination::PeerClosed,
            Some(Err(e)) => break Termination::ReadFailed(e.into()),
            Some(Ok(Inbound::Line(line))) => {
                if let Err(e) = session.handle(&line).await {
                    break Termination::ServerClosed(e);
                }
            }
            Some(Ok(Inbound::Overlong)) => {
                debug!("Dropped over-long line from {}", session.id());
                let _ = session.send(ServerMessage::LineTooLong);
            }
        }
        pulse.beat();
    };
    watchdog.abort();
    drop(pulse);
    drop(lines);

    match &termination {
        Termination::IdleTimeout => {
            info!("Evicting idle session {} ('{}')", session.id(), session.identity());
            let _ = session.send(ServerMessage::Evicted);
        }
        Termination::ReadFailed(e) => warn!("Read failed for {}: {}", session.id(), e),
        other => debug!("Session {} ended: {:?}", session.id(), other),
    }

    if let Err(e) = session.announce_offline().await {
        warn!("Could not deregister {}: {}", session.id(), e);
    }

    let id = session.id();
    drop(session);

    if !matches!(termination, Termination::WriteFailed)
        && time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err()
    {
        debug!("Writer for {} did not drain in time", id);
        writer.abort();
    }

    info!("Session {} closed", id);
    Ok(termination)
}

/// Map the watchdog task's outcome to a termination cause
fn expiry_termination(expiry: Result<Expiry, JoinError>) -> Termination {
    match expiry {
        Ok(Expiry::Idle) => Termination::IdleTimeout,
        // Not produced while the pulse is still alive
        Ok(Expiry::Released) => Termination::PeerClosed,
        Err(e) => {
            warn!("Idle watchdog failed: {}", e);
            Termination::WatchdogFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::Server;
    use futures_util::SinkExt;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio::task::JoinHandle;
    use tokio_util::codec::{Framed, LinesCodec};

    type Client = Framed<DuplexStream, LinesCodec>;

    fn connect(ctx: &ServerContext, address: &str) -> (Client, JoinHandle<Result<Termination, AppError>>) {
        let (client, server_side) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(server_side, address.to_string(), ctx.clone()));
        (Framed::new(client, LinesCodec::new()), task)
    }

    /// Connect and wait until the join notice has been fanned out
    ///
    /// The client's own chat echo follows its join notice through the
    /// single fan-out, so later joiners never see either.
    async fn connect_ready(
        ctx: &ServerContext,
        address: &str,
    ) -> (Client, JoinHandle<Result<Termination, AppError>>) {
        let (mut client, task) = connect(ctx, address);
        client.send("ready".to_string()).await.unwrap();
        let echo = format!("[{}]{}:ready", address, address);
        while next_line(&mut client).await.unwrap() != echo {}
        (client, task)
    }

    async fn next_line(client: &mut Client) -> Option<String> {
        client.next().await.map(|line| line.unwrap())
    }

    async fn wait_registered(ctx: &ServerContext, identity: &str) {
        while ctx.registry.lookup(identity).await.unwrap().is_none() {
            tokio::task::yield_now().await;
        }
    }

    /// Stream whose reads or writes fail on demand
    struct Faulty {
        inner: DuplexStream,
        fail_reads: bool,
        fail_writes: bool,
    }

    impl AsyncRead for Faulty {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.fail_reads {
                return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
            }
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Faulty {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.fail_writes {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_join_who_and_leave() {
        let server = Server::start(Config::default());
        let ctx = server.context();

        let (mut b, _b_task) = connect_ready(&ctx, "10.0.0.2:5000").await;
        let (mut a, a_task) = connect(&ctx, "10.0.0.1:5000");

        assert_eq!(
            next_line(&mut b).await.unwrap(),
            "[10.0.0.1:5000]10.0.0.1:5000:已上线"
        );

        a.send("who".to_string()).await.unwrap();
        assert_eq!(next_line(&mut a).await.unwrap(), "[10.0.0.1:5000]10.0.0.1:5000:在线...");
        assert_eq!(next_line(&mut a).await.unwrap(), "[10.0.0.2:5000]10.0.0.2:5000:在线...");

        drop(a);
        assert!(matches!(a_task.await.unwrap(), Ok(Termination::PeerClosed)));
        assert_eq!(
            next_line(&mut b).await.unwrap(),
            "[10.0.0.1:5000]10.0.0.1:5000:下线"
        );
        assert!(ctx.registry.lookup("10.0.0.1:5000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_crlf_and_unterminated_lines() {
        let server = Server::start(Config::default());
        let ctx = server.context();

        let (mut b, _b_task) = connect_ready(&ctx, "10.0.0.2:5000").await;

        let (raw, server_side) = tokio::io::duplex(4096);
        let a_task = tokio::spawn(handle_connection(server_side, "10.0.0.1:5000".to_string(), ctx.clone()));
        assert_eq!(next_line(&mut b).await.unwrap(), "[10.0.0.1:5000]10.0.0.1:5000:已上线");

        let (_raw_read, mut raw_write) = tokio::io::split(raw);
        raw_write.write_all(b"hello\r\nbye").await.unwrap();
        raw_write.shutdown().await.unwrap();

        assert_eq!(next_line(&mut b).await.unwrap(), "[10.0.0.1:5000]10.0.0.1:5000:hello");
        assert_eq!(next_line(&mut b).await.unwrap(), "[10.0.0.1:5000]10.0.0.1:5000:bye");
        assert_eq!(next_line(&mut b).await.unwrap(), "[10.0.0.1:5000]10.0.0.1:5000:下线");
        assert!(matches!(a_task.await.unwrap(), Ok(Termination::PeerClosed)));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_delivered_lossily() {
        let server = Server::start(Config::default());
        let ctx = server.context();

        let (mut b, _b_task) = connect_ready(&ctx, "10.0.0.2:5000").await;

        let (mut raw, server_side) = tokio::io::duplex(4096);
        let a_task = tokio::spawn(handle_connection(server_side, "10.0.0.1:5000".to_string(), ctx.clone()));
        assert_eq!(next_line(&mut b).await.unwrap(), "[10.0.0.1:5000]10.0.0.1:5000:已上线");

        raw.write_all(b"caf\xe9\n").await.unwrap();

        assert_eq!(
            next_line(&mut b).await.unwrap(),
            "[10.0.0.1:5000]10.0.0.1:5000:caf\u{FFFD}"
        );
        assert!(!a_task.is_finished());
        assert!(ctx.registry.lookup("10.0.0.1:5000").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overlong_line_gets_a_notice_and_session_survives() {
        let config = Config {
            max_line_length: 16,
            ..Config::default()
        };
        let server = Server::start(config);
        let ctx = server.context();

        let (mut b, _b_task) = connect_ready(&ctx, "10.0.0.2:5000").await;
        let (mut a, a_task) = connect(&ctx, "10.0.0.1:5000");
        assert_eq!(next_line(&mut b).await.unwrap(), "[10.0.0.1:5000]10.0.0.1:5000:已上线");

        a.send("x".repeat(64)).await.unwrap();
        a.send("after".to_string()).await.unwrap();

        assert_eq!(next_line(&mut a).await.unwrap(), "消息过长，已丢弃");
        assert_eq!(next_line(&mut a).await.unwrap(), "[10.0.0.1:5000]10.0.0.1:5000:after");
        assert_eq!(next_line(&mut b).await.unwrap(), "[10.0.0.1:5000]10.0.0.1:5000:after");
        assert!(!a_task.is_finished());
    }

    #[tokio::test]
    async fn test_write_failure_after_rename_deregisters_new_name() {
        let server = Server::start(Config::default());
        let ctx = server.context();

        let (mut b, _b_task) = connect_ready(&ctx, "10.0.0.2:5000").await;

        // Reads work, every write fails: the rename notice is what kills the writer
        let (mut raw, inner) = tokio::io::duplex(4096);
        raw.write_all(b"rename|alice\n").await.unwrap();
        let stream = Faulty {
            inner,
            fail_reads: false,
            fail_writes: true,
        };
        let a_task = tokio::spawn(handle_connection(stream, "10.0.0.1:5000".to_string(), ctx.clone()));

        assert_eq!(next_line(&mut b).await.unwrap(), "[10.0.0.1:5000]10.0.0.1:5000:已上线");
        assert_eq!(next_line(&mut b).await.unwrap(), "[10.0.0.1:5000]alice:下线");
        assert!(matches!(a_task.await.unwrap(), Ok(Termination::WriteFailed)));

        assert!(ctx.registry.lookup("alice").await.unwrap().is_none());
        let online: Vec<String> = ctx
            .registry
            .snapshot()
            .await
            .unwrap()
            .into_iter()
            .map(|handle| handle.identity)
            .collect();
        assert_eq!(online, vec!["10.0.0.2:5000"]);
    }

    #[tokio::test]
    async fn test_read_error_announces_offline() {
        let server = Server::start(Config::default());
        let ctx = server.context();

        let (mut b, _b_task) = connect_ready(&ctx, "10.0.0.2:5000").await;

        let (_raw, inner) = tokio::io::duplex(4096);
        let stream = Faulty {
            inner,
            fail_reads: true,
            fail_writes: false,
        };
        let a_task = tokio::spawn(handle_connection(stream, "10.0.0.1:5000".to_string(), ctx.clone()));

        assert_eq!(next_line(&mut b).await.unwrap(), "[10.0.0.1:5000]10.0.0.1:5000:已上线");
        assert_eq!(next_line(&mut b).await.unwrap(), "[10.0.0.1:5000]10.0.0.1:5000:下线");
        match a_task.await.unwrap() {
            Ok(Termination::ReadFailed(AppError::Io(e))) => {
                assert_eq!(e.kind(), io::ErrorKind::ConnectionReset)
            }
            other => panic!("unexpected termination: {:?}", other),
        }
        assert!(ctx.registry.lookup("10.0.0.1:5000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watchdog_failure_is_not_a_peer_close() {
        let task = tokio::spawn(std::future::pending::<Expiry>());
        task.abort();

        assert!(matches!(expiry_termination(task.await), Termination::WatchdogFailed));
        assert!(matches!(expiry_termination(Ok(Expiry::Idle)), Termination::IdleTimeout));
    }

    #[tokio::test]
    async fn test_address_taken_by_rename_is_rejected() {
        let server = Server::start(Config::default());
        let ctx = server.context();

        let (mut b, _b_task) = connect(&ctx, "10.0.0.2:5000");
        wait_registered(&ctx, "10.0.0.2:5000").await;
        b.send("rename|10.0.0.1:5000".to_string()).await.unwrap();
        assert_eq!(next_line(&mut b).await.unwrap(), "您已经更新用户名:10.0.0.1:5000");

        let (mut a, a_task) = connect(&ctx, "10.0.0.1:5000");

        assert_eq!(next_line(&mut a).await.unwrap(), "当前用户名被使用");
        assert!(next_line(&mut a).await.is_none());
        assert!(matches!(a_task.await.unwrap(), Err(AppError::NameInUse(_))));

        let owner = ctx.registry.lookup("10.0.0.1:5000").await.unwrap().unwrap();
        assert_eq!(owner.address, "10.0.0.2:5000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_evicted() {
        let server = Server::start(Config::default());
        let ctx = server.context();

        let (mut a, a_task) = connect(&ctx, "10.0.0.1:5000");
        wait_registered(&ctx, "10.0.0.1:5000").await;
        a.send("rename|alice".to_string()).await.unwrap();
        assert_eq!(next_line(&mut a).await.unwrap(), "您已经更新用户名:alice");

        time::sleep(Duration::from_secs(200)).await;
        let (mut b, _b_task) = connect(&ctx, "10.0.0.2:5000");
        wait_registered(&ctx, "10.0.0.2:5000").await;
        assert_eq!(next_line(&mut a).await.unwrap(), "[10.0.0.2:5000]10.0.0.2:5000:已上线");

        assert_eq!(next_line(&mut a).await.unwrap(), "你被踢了");
        assert!(next_line(&mut a).await.is_none());
        assert!(matches!(a_task.await.unwrap(), Ok(Termination::IdleTimeout)));

        assert_eq!(next_line(&mut b).await.unwrap(), "[10.0.0.1:5000]alice:下线");
        assert!(ctx.registry.lookup("alice").await.unwrap().is_none());
        assert!(ctx.registry.lookup("10.0.0.2:5000").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_session_is_never_evicted() {
        let server = Server::start(Config::default());
        let ctx = server.context();

        let (mut a, a_task) = connect(&ctx, "10.0.0.1:5000");
        wait_registered(&ctx, "10.0.0.1:5000").await;

        for round in 0..4 {
            time::sleep(Duration::from_secs(250)).await;
            a.send(format!("still here {}", round)).await.unwrap();
            assert_eq!(
                next_line(&mut a).await.unwrap(),
                format!("[10.0.0.1:5000]10.0.0.1:5000:still here {}", round)
            );
        }

        assert!(!a_task.is_finished());
        assert!(ctx.registry.lookup("10.0.0.1:5000").await.unwrap().is_some());
    }
}
