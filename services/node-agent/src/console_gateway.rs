//! Console gateway server for node-agent.
//!
//! Accepts attach streams from the control plane. Each connection opens
//! with an INIT frame naming the container. The gateway answers READY once
//! attached (or EXIT with the reason it could not attach), then relays the
//! container's stdout/stderr as output frames and writes STDIN frames to the
//! container. When the container's output closes it sends an EXIT frame.
//! If the control plane hangs up first, the attachment is dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kiln_protocol::console::{frame_type, parse_init, read_frame, write_frame, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::runtime::{BoxedReader, BoxedWriter, ContainerRuntime};

const INIT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 4096;

/// Console gateway server.
pub struct ConsoleGateway {
    listener: TcpListener,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ConsoleGateway {
    pub async fn bind(listen_addr: SocketAddr, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        Ok(Self { listener, runtime })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown is signaled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Console gateway listening");
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Console gateway accept failed");
                            continue;
                        }
                    };
                    let runtime = Arc::clone(&self.runtime);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, runtime).await {
                            warn!(error = %e, peer = %peer, "Console connection failed");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Console gateway shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    runtime: Arc<dyn ContainerRuntime>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let Some(init_frame) = tokio::time::timeout(INIT_TIMEOUT, read_frame(&mut reader)).await??
    else {
        return Ok(());
    };
    if init_frame.kind != frame_type::INIT {
        warn!(peer = %peer, kind = init_frame.kind, "Console gateway received invalid init frame");
        write_frame(&mut writer, &Frame::exit("invalid_init")?).await?;
        return Ok(());
    }
    let init = parse_init(&init_frame)?;
    let container = init.container_ref;

    let streams = match runtime.attach(&container).await {
        Ok(streams) => streams,
        Err(e) => {
            info!(container = %container, error = %e, "Console attach refused");
            write_frame(&mut writer, &Frame::exit(&e.to_string())?).await?;
            return Ok(());
        }
    };
    write_frame(&mut writer, &Frame::ready()).await?;
    info!(container = %container, peer = %peer, "Console attached");

    let mut input = tokio::spawn(pump_stdin(reader, streams.stdin));
    let mut stdout = streams.stdout;
    let mut stderr = streams.stderr;
    let _process = streams.process;

    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let reason = loop {
        tokio::select! {
            read = stdout.read(&mut out_buf) => {
                match read {
                    Ok(0) | Err(_) => break "container_exited",
                    Ok(n) => {
                        let frame = Frame::new(frame_type::STDOUT, out_buf[..n].to_vec());
                        if write_frame(&mut writer, &frame).await.is_err() {
                            break "client_disconnect";
                        }
                    }
                }
            }
            read = read_optional(&mut stderr, &mut err_buf) => {
                match read {
                    Ok(0) | Err(_) => stderr = None,
                    Ok(n) => {
                        let frame = Frame::new(frame_type::STDERR, err_buf[..n].to_vec());
                        if write_frame(&mut writer, &frame).await.is_err() {
                            break "client_disconnect";
                        }
                    }
                }
            }
            _ = &mut input => break "client_disconnect",
        }
    };

    input.abort();
    if reason != "client_disconnect" {
        let _ = write_frame(&mut writer, &Frame::exit(reason)?).await;
    }
    debug!(container = %container, reason, "Console detached");
    Ok(())
}

/// Read from stderr if there still is one; otherwise never resolve.
async fn read_optional(stream: &mut Option<BoxedReader>, buf: &mut [u8]) -> std::io::Result<usize> {
    match stream {
        Some(s) => s.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Copy STDIN frames to the container until the control plane hangs up.
async fn pump_stdin(mut reader: tokio::net::tcp::OwnedReadHalf, mut stdin: BoxedWriter) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) if frame.kind == frame_type::STDIN => {
                if stdin.write_all(&frame.payload).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
            Ok(Some(frame)) => {
                debug!(kind = frame.kind, "Ignoring unexpected console frame");
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Console input stream failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kiln_id::ServerId;
    use kiln_protocol::console::{parse_exit, ConsoleInit};
    use kiln_protocol::{ContainerRef, ContainerSpec, Resources};

    use super::*;
    use crate::runtime::MockRuntime;

    async fn running_container(runtime: &MockRuntime) -> ContainerRef {
        let spec = ContainerSpec {
            server_id: ServerId::new(),
            image: "test:latest".to_string(),
            resources: Resources::new(100, 512, 1),
            host_port: 25565,
            container_port: 25565,
            env: BTreeMap::new(),
        };
        let c = runtime.create(&spec).await.unwrap().container_ref;
        runtime.start(&c).await.unwrap();
        c
    }

    async fn gateway(runtime: Arc<MockRuntime>) -> (SocketAddr, watch::Sender<bool>) {
        let gateway = ConsoleGateway::bind("127.0.0.1:0".parse().unwrap(), runtime)
            .await
            .unwrap();
        let addr = gateway.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(gateway.run(rx));
        (addr, tx)
    }

    async fn connect(addr: SocketAddr, container: &ContainerRef) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let init = Frame::init(&ConsoleInit {
            container_ref: container.clone(),
        })
        .unwrap();
        write_frame(&mut stream, &init).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn test_input_is_echoed_as_stdout() {
        let runtime = Arc::new(MockRuntime::new());
        let container = running_container(&runtime).await;
        let (addr, _shutdown) = gateway(runtime).await;

        let mut stream = connect(addr, &container).await;
        let ready = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(ready.kind, frame_type::READY);
        write_frame(&mut stream, &Frame::new(frame_type::STDIN, "list\n"))
            .await
            .unwrap();

        let frame = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(frame.kind, frame_type::STDOUT);
        assert_eq!(&frame.payload[..], b"[mock] list\n");
    }

    #[tokio::test]
    async fn test_container_exit_sends_exit_frame() {
        let runtime = Arc::new(MockRuntime::new());
        let container = running_container(&runtime).await;
        let (addr, _shutdown) = gateway(Arc::clone(&runtime)).await;

        let mut stream = connect(addr, &container).await;
        write_frame(&mut stream, &Frame::new(frame_type::STDIN, "stop\n"))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Some(frame) = read_frame(&mut stream).await.unwrap() {
            kinds.push(frame.kind);
        }
        assert_eq!(kinds.first(), Some(&frame_type::READY));
        assert_eq!(kinds.last(), Some(&frame_type::EXIT));
    }

    #[tokio::test]
    async fn test_attach_to_stopped_container_is_refused() {
        let runtime = Arc::new(MockRuntime::new());
        let (addr, _shutdown) = gateway(runtime).await;

        let mut stream = connect(addr, &ContainerRef::new("kiln-absent")).await;
        let frame = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(frame.kind, frame_type::EXIT);
        assert!(!parse_exit(&frame).unwrap().reason.is_empty());
        assert!(read_frame(&mut stream).await.unwrap().is_none());
    }
}
