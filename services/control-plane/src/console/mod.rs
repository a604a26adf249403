//! Console proxy.
//!
//! One bridge task per container owns the node-side attach stream and fans
//! its output to every attached viewer. The first attach opens the stream,
//! the last detach closes it.
//!
//! Each viewer gets a bounded output channel. A viewer that falls behind by
//! a full buffer is evicted rather than handed a stream with holes in it;
//! everyone else keeps receiving. Input from all viewers funnels into one
//! channel and is written upstream in arrival order.

mod upstream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use kiln_id::ViewerId;
use kiln_protocol::console::{frame_type, read_frame, write_frame, Frame, MAX_PAYLOAD_LEN};
use kiln_protocol::ContainerRef;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub use upstream::{ConsoleConnector, ConsoleTarget, TcpConsoleConnector, Upstream};

use crate::error::{ControlPlaneError, ControlPlaneResult};

pub const DEFAULT_VIEWER_BUFFER: usize = 256;
const INPUT_BUFFER: usize = 64;

type Bridges = Arc<Mutex<HashMap<ContainerRef, BridgeEntry>>>;

struct BridgeEntry {
    bridge_id: u64,
    viewers: HashMap<ViewerId, mpsc::Sender<Bytes>>,
    input: mpsc::Sender<Bytes>,
    shutdown: Option<oneshot::Sender<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct ConsoleProxy {
    connector: Arc<dyn ConsoleConnector>,
    bridges: Bridges,
    opening: Mutex<HashMap<ContainerRef, Arc<tokio::sync::Mutex<()>>>>,
    next_bridge_id: AtomicU64,
    viewer_buffer: usize,
}

impl ConsoleProxy {
    pub fn new(connector: Arc<dyn ConsoleConnector>, viewer_buffer: usize) -> Self {
        Self {
            connector,
            bridges: Arc::new(Mutex::new(HashMap::new())),
            opening: Mutex::new(HashMap::new()),
            next_bridge_id: AtomicU64::new(1),
            viewer_buffer: viewer_buffer.max(1),
        }
    }

    /// Number of containers with a live upstream.
    pub fn active_bridges(&self) -> usize {
        lock(&self.bridges).len()
    }

    /// Viewers currently attached to a container.
    pub fn viewer_count(&self, container: &ContainerRef) -> usize {
        lock(&self.bridges)
            .get(container)
            .map_or(0, |entry| entry.viewers.len())
    }

    /// Attach a viewer, opening the upstream if nobody is attached yet.
    ///
    /// A failure to open is reported to this caller only.
    pub async fn attach(&self, target: ConsoleTarget) -> ControlPlaneResult<ConsoleSession> {
        let viewer_id = ViewerId::new();
        let (tx, rx) = mpsc::channel(self.viewer_buffer);

        if let Some((bridge_id, input)) = self.join(&target.container_ref, viewer_id, &tx) {
            return Ok(self.session(&target.container_ref, viewer_id, bridge_id, rx, input));
        }

        // Concurrent first attaches to one container must not open two
        // upstreams.
        let open_lock = {
            let mut opening = lock(&self.opening);
            Arc::clone(opening.entry(target.container_ref.clone()).or_default())
        };
        let joined = {
            let _guard = open_lock.lock().await;
            match self.join(&target.container_ref, viewer_id, &tx) {
                Some(joined) => Ok(joined),
                None => self.open(&target, viewer_id, tx).await,
            }
        };
        {
            let mut opening = lock(&self.opening);
            if Arc::strong_count(&open_lock) == 2 {
                opening.remove(&target.container_ref);
            }
        }

        let (bridge_id, input) = joined?;
        Ok(self.session(&target.container_ref, viewer_id, bridge_id, rx, input))
    }

    fn join(
        &self,
        container: &ContainerRef,
        viewer_id: ViewerId,
        tx: &mpsc::Sender<Bytes>,
    ) -> Option<(u64, mpsc::Sender<Bytes>)> {
        let mut bridges = lock(&self.bridges);
        let entry = bridges.get_mut(container)?;
        entry.viewers.insert(viewer_id, tx.clone());
        debug!(
            container = %container,
            viewer_id = %viewer_id,
            viewers = entry.viewers.len(),
            "Viewer joined console"
        );
        Some((entry.bridge_id, entry.input.clone()))
    }

    async fn open(
        &self,
        target: &ConsoleTarget,
        viewer_id: ViewerId,
        tx: mpsc::Sender<Bytes>,
    ) -> ControlPlaneResult<(u64, mpsc::Sender<Bytes>)> {
        let upstream = self.connector.open(target).await.map_err(|e| {
            warn!(
                container = %target.container_ref,
                node_id = %target.node_id,
                error = %e,
                "Console attach failed"
            );
            ControlPlaneError::UpstreamStream {
                container_ref: target.container_ref.clone(),
                message: e.to_string(),
            }
        })?;

        let bridge_id = self.next_bridge_id.fetch_add(1, Ordering::Relaxed);
        let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        lock(&self.bridges).insert(
            target.container_ref.clone(),
            BridgeEntry {
                bridge_id,
                viewers: HashMap::from([(viewer_id, tx)]),
                input: input_tx.clone(),
                shutdown: Some(shutdown_tx),
            },
        );

        info!(
            container = %target.container_ref,
            node_id = %target.node_id,
            bridge_id,
            "Console bridge opened"
        );

        tokio::spawn(run_bridge(
            target.container_ref.clone(),
            bridge_id,
            upstream,
            input_rx,
            shutdown_rx,
            Arc::clone(&self.bridges),
        ));

        Ok((bridge_id, input_tx))
    }

    fn session(
        &self,
        container: &ContainerRef,
        viewer_id: ViewerId,
        bridge_id: u64,
        output: mpsc::Receiver<Bytes>,
        input: mpsc::Sender<Bytes>,
    ) -> ConsoleSession {
        ConsoleSession {
            viewer_id,
            container_ref: container.clone(),
            bridge_id,
            output,
            input,
            bridges: Arc::clone(&self.bridges),
        }
    }
}

/// One viewer's attachment. Dropping it detaches.
pub struct ConsoleSession {
    viewer_id: ViewerId,
    container_ref: ContainerRef,
    bridge_id: u64,
    output: mpsc::Receiver<Bytes>,
    input: mpsc::Sender<Bytes>,
    bridges: Bridges,
}

impl ConsoleSession {
    pub fn viewer_id(&self) -> ViewerId {
        self.viewer_id
    }

    pub fn container_ref(&self) -> &ContainerRef {
        &self.container_ref
    }

    /// Next chunk of raw output. `None` once the console is gone or this
    /// viewer was evicted.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.output.recv().await
    }

    /// Queue input for the container's stdin.
    pub async fn send_input(&self, data: Bytes) -> ControlPlaneResult<()> {
        self.input
            .send(data)
            .await
            .map_err(|_| ControlPlaneError::UpstreamStream {
                container_ref: self.container_ref.clone(),
                message: "console closed".into(),
            })
    }
}

impl Drop for ConsoleSession {
    fn drop(&mut self) {
        let mut bridges = lock(&self.bridges);
        let Some(entry) = bridges.get_mut(&self.container_ref) else {
            return;
        };
        if entry.bridge_id != self.bridge_id {
            return;
        }
        entry.viewers.remove(&self.viewer_id);
        debug!(
            container = %self.container_ref,
            viewer_id = %self.viewer_id,
            viewers = entry.viewers.len(),
            "Viewer left console"
        );
        if entry.viewers.is_empty() {
            if let Some(shutdown) = entry.shutdown.take() {
                let _ = shutdown.send(());
            }
            bridges.remove(&self.container_ref);
        }
    }
}

async fn run_bridge(
    container: ContainerRef,
    bridge_id: u64,
    upstream: Upstream,
    input: mpsc::Receiver<Bytes>,
    mut shutdown: oneshot::Receiver<()>,
    bridges: Bridges,
) {
    let Upstream { mut reader, writer } = upstream;
    let writer_task = tokio::spawn(pump_input(container.clone(), writer, input));

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!(container = %container, bridge_id, "Last viewer left");
                break;
            }
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(frame)) if frame.is_output() => {
                    fan_out(&bridges, &container, bridge_id, frame.payload);
                }
                Ok(Some(frame)) if frame.kind == frame_type::EXIT => {
                    info!(container = %container, bridge_id, "Container console exited");
                    break;
                }
                Ok(Some(frame)) => {
                    debug!(container = %container, kind = frame.kind, "Ignoring console frame");
                }
                Ok(None) => {
                    info!(container = %container, bridge_id, "Console upstream closed");
                    break;
                }
                Err(e) => {
                    warn!(container = %container, bridge_id, error = %e, "Console upstream failed");
                    break;
                }
            }
        }
    }

    writer_task.abort();
    let mut bridges = lock(&bridges);
    if bridges
        .get(&container)
        .is_some_and(|entry| entry.bridge_id == bridge_id)
    {
        bridges.remove(&container);
    }
}

async fn pump_input(
    container: ContainerRef,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut input: mpsc::Receiver<Bytes>,
) {
    'input: while let Some(mut data) = input.recv().await {
        // Input larger than one frame is split; stdin is a byte stream.
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(MAX_PAYLOAD_LEN));
            if let Err(e) = write_frame(&mut writer, &Frame::new(frame_type::STDIN, chunk)).await {
                warn!(container = %container, error = %e, "Console input write failed");
                break 'input;
            }
        }
    }
    let _ = writer.shutdown().await;
}

fn fan_out(bridges: &Bridges, container: &ContainerRef, bridge_id: u64, payload: Bytes) {
    let mut bridges = lock(bridges);
    let Some(entry) = bridges.get_mut(container) else {
        return;
    };
    if entry.bridge_id != bridge_id {
        return;
    }
    entry.viewers.retain(|viewer_id, tx| match tx.try_send(payload.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(container = %container, viewer_id = %viewer_id, "Evicting lagging console viewer");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use kiln_id::NodeId;
    use kiln_protocol::console::{parse_init, ConsoleInit};
    use tokio::io::DuplexStream;

    use super::*;

    /// Hands out in-memory pipes; the test keeps the agent ends.
    #[derive(Default)]
    struct PipeConnector {
        opens: AtomicUsize,
        agent_ends: Mutex<Vec<DuplexStream>>,
        refuse: bool,
    }

    impl PipeConnector {
        fn take_agent_end(&self) -> DuplexStream {
            lock(&self.agent_ends).pop().expect("no upstream was opened")
        }
    }

    #[async_trait]
    impl ConsoleConnector for PipeConnector {
        async fn open(&self, target: &ConsoleTarget) -> anyhow::Result<Upstream> {
            if self.refuse {
                anyhow::bail!("connection refused");
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
            let (reader, mut writer) = tokio::io::split(ours);
            let init = Frame::init(&ConsoleInit {
                container_ref: target.container_ref.clone(),
            })?;
            write_frame(&mut writer, &init).await?;
            let got = read_frame(&mut theirs).await?.expect("init frame");
            assert_eq!(parse_init(&got)?.container_ref, target.container_ref);
            lock(&self.agent_ends).push(theirs);
            Ok(Upstream {
                reader: Box::new(reader),
                writer: Box::new(writer),
            })
        }
    }

    fn target() -> ConsoleTarget {
        ConsoleTarget {
            node_id: NodeId::new(),
            console_addr: "127.0.0.1:5002".parse().unwrap(),
            container_ref: ContainerRef::new("ctr-1"),
        }
    }

    async fn recv(session: &mut ConsoleSession) -> Option<Bytes> {
        tokio::time::timeout(Duration::from_secs(1), session.recv())
            .await
            .expect("timed out waiting for console output")
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_two_viewers_share_one_upstream() {
        let connector = Arc::new(PipeConnector::default());
        let proxy = ConsoleProxy::new(connector.clone(), 16);

        let mut a = proxy.attach(target()).await.unwrap();
        let mut b = proxy.attach(target()).await.unwrap();
        assert_eq!(connector.opens.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.viewer_count(&ContainerRef::new("ctr-1")), 2);

        let mut agent = connector.take_agent_end();
        for chunk in ["[Server] Done (3.2s)!\n", "> ", "\u{1b}[0m"] {
            write_frame(&mut agent, &Frame::new(frame_type::STDOUT, chunk.as_bytes().to_vec()))
                .await
                .unwrap();
        }

        for session in [&mut a, &mut b] {
            let mut seen = Vec::new();
            while seen.len() < "[Server] Done (3.2s)!\n> \u{1b}[0m".len() {
                seen.extend_from_slice(&recv(session).await.unwrap());
            }
            assert_eq!(seen, "[Server] Done (3.2s)!\n> \u{1b}[0m".as_bytes());
        }
    }

    #[tokio::test]
    async fn test_one_viewer_leaving_keeps_the_other() {
        let connector = Arc::new(PipeConnector::default());
        let proxy = ConsoleProxy::new(connector.clone(), 16);
        let a = proxy.attach(target()).await.unwrap();
        let mut b = proxy.attach(target()).await.unwrap();
        let mut agent = connector.take_agent_end();

        drop(a);
        settle().await;

        write_frame(&mut agent, &Frame::new(frame_type::STDERR, &b"still here"[..]))
            .await
            .unwrap();
        assert_eq!(recv(&mut b).await.unwrap(), Bytes::from_static(b"still here"));
        assert_eq!(proxy.active_bridges(), 1);
    }

    #[tokio::test]
    async fn test_last_detach_closes_upstream() {
        let connector = Arc::new(PipeConnector::default());
        let proxy = ConsoleProxy::new(connector.clone(), 16);
        let a = proxy.attach(target()).await.unwrap();
        let b = proxy.attach(target()).await.unwrap();
        let mut agent = connector.take_agent_end();

        drop(a);
        drop(b);
        assert_eq!(proxy.active_bridges(), 0);

        let eof = tokio::time::timeout(Duration::from_secs(1), read_frame(&mut agent))
            .await
            .unwrap()
            .unwrap();
        assert!(eof.is_none());

        proxy.attach(target()).await.unwrap();
        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_input_reaches_upstream_stdin() {
        let connector = Arc::new(PipeConnector::default());
        let proxy = ConsoleProxy::new(connector.clone(), 16);
        let session = proxy.attach(target()).await.unwrap();
        let mut agent = connector.take_agent_end();

        session.send_input(Bytes::from_static(b"say hi\n")).await.unwrap();

        let frame = read_frame(&mut agent).await.unwrap().unwrap();
        assert_eq!(frame.kind, frame_type::STDIN);
        assert_eq!(frame.payload, Bytes::from_static(b"say hi\n"));
    }

    #[tokio::test]
    async fn test_attach_failure_is_reported_to_caller() {
        let connector = Arc::new(PipeConnector {
            refuse: true,
            ..Default::default()
        });
        let proxy = ConsoleProxy::new(connector, 16);

        let err = proxy.attach(target()).await.err().unwrap();

        assert!(matches!(err, ControlPlaneError::UpstreamStream { .. }));
        assert_eq!(proxy.active_bridges(), 0);
    }

    #[tokio::test]
    async fn test_upstream_exit_ends_sessions() {
        let connector = Arc::new(PipeConnector::default());
        let proxy = ConsoleProxy::new(connector.clone(), 16);
        let mut session = proxy.attach(target()).await.unwrap();
        let mut agent = connector.take_agent_end();

        write_frame(&mut agent, &Frame::exit("container stopped").unwrap())
            .await
            .unwrap();

        assert!(recv(&mut session).await.is_none());
        assert_eq!(proxy.active_bridges(), 0);
    }

    #[tokio::test]
    async fn test_oversized_input_is_split_and_console_stays_open() {
        let connector = Arc::new(PipeConnector::default());
        let proxy = ConsoleProxy::new(connector.clone(), 16);
        let a = proxy.attach(target()).await.unwrap();
        let b = proxy.attach(target()).await.unwrap();
        let mut agent = connector.take_agent_end();

        let big = Bytes::from(vec![b'x'; 2 * 1024 * 1024 + 10]);
        a.send_input(big.clone()).await.unwrap();
        b.send_input(Bytes::from_static(b"say hi\n")).await.unwrap();

        let mut received = Vec::new();
        let mut frames = 0;
        while received.len() < big.len() {
            let frame = read_frame(&mut agent).await.unwrap().unwrap();
            assert_eq!(frame.kind, frame_type::STDIN);
            assert!(frame.payload.len() <= MAX_PAYLOAD_LEN);
            received.extend_from_slice(&frame.payload);
            frames += 1;
        }
        assert_eq!(received.len(), big.len());
        assert_eq!(frames, 3);

        let next = read_frame(&mut agent).await.unwrap().unwrap();
        assert_eq!(next.payload, Bytes::from_static(b"say hi\n"));
        assert_eq!(proxy.active_bridges(), 1);
    }

    #[tokio::test]
    async fn test_lagging_viewer_is_evicted_alone() {
        let connector = Arc::new(PipeConnector::default());
        let proxy = ConsoleProxy::new(connector.clone(), 2);
        let mut fast = proxy.attach(target()).await.unwrap();
        let mut slow = proxy.attach(target()).await.unwrap();
        let mut agent = connector.take_agent_end();

        for i in 0..4u8 {
            write_frame(&mut agent, &Frame::new(frame_type::STDOUT, vec![i]))
                .await
                .unwrap();
            assert_eq!(recv(&mut fast).await.unwrap(), Bytes::from(vec![i]));
        }

        assert_eq!(recv(&mut slow).await.unwrap(), Bytes::from(vec![0]));
        assert_eq!(recv(&mut slow).await.unwrap(), Bytes::from(vec![1]));
        assert!(recv(&mut slow).await.is_none());
        assert_eq!(proxy.viewer_count(&ContainerRef::new("ctr-1")), 1);
    }
}
