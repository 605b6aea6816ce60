//! 连接与等待
//!
//! 命令行只做一次性操作：连接、等待某个事件、断开。

use std::time::Duration;

use anyhow::{Context, Result, bail};
use pfxlink_core::{LinkState, QueueKind, SessionEvent, SessionHandle, Settings};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// 服务发现和查询的等待时间
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// 写队列静默多久视为已发送完
const SETTLE_TIME: Duration = Duration::from_millis(300);

/// 连接并等待服务发现完成
pub async fn open(
    session: &SessionHandle,
    settings: &Settings,
    address: &str,
) -> Result<broadcast::Receiver<SessionEvent>> {
    let mut events = session.subscribe();
    session.connect(address).await?;

    // 扫描超时之外再留出建立连接的时间
    let connect_timeout = settings.scan_timeout() + EVENT_TIMEOUT;
    timeout(connect_timeout, session.wait_for_state(LinkState::Connected))
        .await
        .with_context(|| format!("Timed out connecting to {address}"))??;

    let event = wait_for(&mut events, |e| {
        matches!(
            e,
            SessionEvent::DiscoveryComplete { .. } | SessionEvent::DiscoveryFailed { .. }
        )
    })
    .await?;
    if let SessionEvent::DiscoveryFailed { reason } = event {
        bail!("Service discovery failed: {reason}");
    }
    Ok(events)
}

/// 等待满足条件的事件；链路断开时报错
pub async fn wait_for(
    events: &mut broadcast::Receiver<SessionEvent>,
    predicate: impl Fn(&SessionEvent) -> bool,
) -> Result<SessionEvent> {
    timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Ok(event),
                Ok(SessionEvent::Disconnected) => bail!("Brick disconnected"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} session events", n);
                }
                Err(broadcast::error::RecvError::Closed) => bail!("Session closed"),
            }
        }
    })
    .await
    .context("Timed out waiting for the brick")?
}

/// 等到特征写不再有动静
pub async fn settle(events: &mut broadcast::Receiver<SessionEvent>) -> Result<()> {
    loop {
        match timeout(SETTLE_TIME, events.recv()).await {
            Err(_) => return Ok(()),
            Ok(Ok(SessionEvent::WriteFailed {
                kind: QueueKind::Characteristic,
                reason,
            })) => bail!("Write failed: {reason}"),
            Ok(Ok(SessionEvent::Disconnected)) => bail!("Brick disconnected"),
            Ok(Ok(_) | Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) => bail!("Session closed"),
        }
    }
}

/// 断开并停止会话
pub async fn close(session: &SessionHandle) -> Result<()> {
    if session.disconnect().await? {
        let _ = timeout(
            EVENT_TIMEOUT,
            session.wait_for_state(LinkState::Disconnected),
        )
        .await;
    }
    session.shutdown().await?;
    Ok(())
}
