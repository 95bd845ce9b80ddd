//! Virtual outstation backend.
//!
//! Each [`Outstation`] owns one TCP listener on a reserved port. Sessions
//! accepted while the outstation is still `Provisioned` are parked until it
//! is enabled; stopping cancels the accept loop, aborts every session and
//! waits for both before returning.

pub mod handler;
pub mod protocol;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker_model::{ServerId, TenantId};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::backend::{BackendHandle, BackendProvisioner, BackendSpec, BackendState};
use crate::store::{InstructionQueue, TelemetryStore};
use crate::{Error, Result};

pub use handler::RequestHandler;
pub use protocol::{AckStatus, ControlValue, PointReport, PointValue, Request, Response};

/// Pause after a failed `accept` so a persistent fault does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

// ─────────────────────────────────────────────────────────────────────────────
// Provisioner
// ─────────────────────────────────────────────────────────────────────────────

/// Settings shared by every outstation.
#[derive(Debug, Clone)]
pub struct OutstationSettings {
    /// Address backends bind to.
    pub bind_host: IpAddr,
    /// Longest accepted request line, in bytes.
    pub max_frame_length: usize,
    /// Topic for queued instructions.
    pub instruction_topic: String,
}

/// Starts [`Outstation`]s backed by shared telemetry and instruction stores.
pub struct OutstationProvisioner {
    settings: OutstationSettings,
    telemetry: Arc<dyn TelemetryStore>,
    instructions: Arc<dyn InstructionQueue>,
}

impl OutstationProvisioner {
    /// Create a provisioner sharing the given stores across outstations.
    #[must_use]
    pub fn new(
        settings: OutstationSettings,
        telemetry: Arc<dyn TelemetryStore>,
        instructions: Arc<dyn InstructionQueue>,
    ) -> Self {
        Self {
            settings,
            telemetry,
            instructions,
        }
    }

    /// Bind host handed to the relay as the proxy destination.
    #[must_use]
    pub fn bind_host(&self) -> IpAddr {
        self.settings.bind_host
    }
}

#[async_trait]
impl BackendProvisioner for OutstationProvisioner {
    type Handle = Outstation;

    async fn start(&self, spec: BackendSpec) -> Result<Outstation> {
        let addr = SocketAddr::new(self.settings.bind_host, spec.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::ProvisioningFailure(format!("Cannot bind outstation on {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::ProvisioningFailure(format!("Outstation socket unusable: {e}")))?;

        let handler = Arc::new(RequestHandler::new(
            spec.points,
            Arc::clone(&self.telemetry),
            Arc::clone(&self.instructions),
            self.settings.instruction_topic.clone(),
        ));
        let (state_tx, state_rx) = watch::channel(BackendState::Provisioned);
        let cancel = CancellationToken::new();

        let span = info_span!(
            "outstation",
            tenant = %spec.tenant_id,
            server = %spec.server_id,
            port = local_addr.port()
        );
        let task = tokio::spawn(
            accept_loop(
                listener,
                handler,
                state_rx,
                cancel.clone(),
                self.settings.max_frame_length,
            )
            .instrument(span),
        );

        info!(
            tenant = %spec.tenant_id,
            server = %spec.server_id,
            addr = %local_addr,
            "Outstation provisioned"
        );

        Ok(Outstation {
            tenant_id: spec.tenant_id,
            server_id: spec.server_id,
            local_addr,
            state: state_tx,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// A running outstation.
pub struct Outstation {
    tenant_id: TenantId,
    server_id: ServerId,
    local_addr: SocketAddr,
    state: watch::Sender<BackendState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Outstation {
    /// Owning tenant.
    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Server this outstation impersonates.
    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }
}

#[async_trait]
impl BackendHandle for Outstation {
    fn state(&self) -> BackendState {
        *self.state.borrow()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn enable(&self) -> Result<()> {
        let mut rejected = None;
        self.state.send_if_modified(|state| {
            if *state == BackendState::Provisioned {
                *state = BackendState::Enabled;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });
        match rejected {
            None => {
                info!(addr = %self.local_addr, "Outstation enabled");
                Ok(())
            }
            Some(state) => Err(Error::InvalidState(format!(
                "Cannot enable outstation on {} in state {state}",
                self.local_addr
            ))),
        }
    }

    async fn stop(&self) {
        let previous = self.state.send_replace(BackendState::Stopped);
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(addr = %self.local_addr, error = %e, "Outstation task ended abnormally");
            }
        }
        if previous != BackendState::Stopped {
            info!(addr = %self.local_addr, "Outstation stopped");
        }
    }
}

impl Drop for Outstation {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Accept loop and sessions
// ─────────────────────────────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<RequestHandler>,
    state: watch::Receiver<BackendState>,
    cancel: CancellationToken,
    max_frame_length: usize,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Session accepted");
                    sessions.spawn(
                        serve_session(stream, Arc::clone(&handler), state.clone(), max_frame_length)
                            .instrument(info_span!("session", %peer)),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    drop(listener);
    sessions.shutdown().await;
    debug!("Accept loop finished");
}

async fn serve_session(
    stream: TcpStream,
    handler: Arc<RequestHandler>,
    mut state: watch::Receiver<BackendState>,
    max_frame_length: usize,
) {
    let enabled = matches!(
        state.wait_for(|s| *s != BackendState::Provisioned).await.as_deref(),
        Ok(BackendState::Enabled)
    );
    if !enabled {
        debug!("Outstation stopped before enable, closing session");
        return;
    }

    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(max_frame_length));

    while let Some(frame) = framed.next().await {
        let response = match frame {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => match protocol::parse_request(&line) {
                Ok(request) => handler.handle(request).await,
                Err(e) => Response::Error {
                    message: format!("Malformed request: {e}"),
                },
            },
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                let reply = Response::Error {
                    message: format!("Request exceeds {max_frame_length} bytes"),
                };
                if let Ok(line) = reply.to_line() {
                    let _ = framed.send(line).await;
                }
                break;
            }
            Err(LinesCodecError::Io(e)) => {
                debug!(error = %e, "Session read failed");
                break;
            }
        };

        let line = match response.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Cannot encode response");
                break;
            }
        };
        if let Err(e) = framed.send(line).await {
            debug!(error = %e, "Session write failed");
            break;
        }
    }

    debug!("Session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::{ControlPoint, MeasurementPoint, PointMap};
    use crate::store::{InMemoryInstructionQueue, InMemoryTelemetryStore, PointKey, Reading};
    use broker_model::{ControlType, MeasurementType};
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn provisioner(
        telemetry: Arc<InMemoryTelemetryStore>,
        queue: Arc<InMemoryInstructionQueue>,
    ) -> OutstationProvisioner {
        OutstationProvisioner::new(
            OutstationSettings {
                bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                max_frame_length: 256,
                instruction_topic: "outstation/operate".into(),
            },
            telemetry,
            queue,
        )
    }

    fn spec(port: u16) -> BackendSpec {
        BackendSpec {
            tenant_id: TenantId::from("u"),
            server_id: ServerId::from("s"),
            port,
            points: PointMap {
                measurements: vec![MeasurementPoint {
                    index: 0,
                    key: PointKey::new("meter", "1", "watts"),
                    point_type: MeasurementType::AnalogInput,
                }],
                controls: vec![ControlPoint {
                    index: 0,
                    node_id: "switch".into(),
                    source_id: "1".into(),
                    property: None,
                    point_type: ControlType::Binary,
                }],
            },
        }
    }

    async fn exchange(
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        request: &str,
    ) -> Response {
        writer.write_all(format!("{request}\n").as_bytes()).await.unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn answers_only_after_enable() {
        // GIVEN: a provisioned outstation with one reading
        let telemetry = Arc::new(InMemoryTelemetryStore::new());
        telemetry.record(
            PointKey::new("meter", "1", "watts"),
            Reading {
                timestamp: Utc::now(),
                value: 464.0,
            },
        );
        let queue = Arc::new(InMemoryInstructionQueue::new(8));
        let outstation = provisioner(telemetry, Arc::clone(&queue))
            .start(spec(0))
            .await
            .unwrap();
        assert_eq!(outstation.state(), BackendState::Provisioned);

        // WHEN: a master connects and sends a scan before enable
        let stream = TcpStream::connect(outstation.local_addr()).await.unwrap();
        let (read, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read);
        writer.write_all(b"{\"op\":\"scan\"}\n").await.unwrap();

        // THEN: nothing is answered until enable
        let mut line = String::new();
        let early =
            tokio::time::timeout(Duration::from_millis(200), reader.read_line(&mut line)).await;
        assert!(early.is_err(), "outstation answered while provisioned");

        outstation.enable().unwrap();
        reader.read_line(&mut line).await.unwrap();
        let response: Response = serde_json::from_str(&line).unwrap();
        assert_eq!(
            response,
            Response::Scan {
                points: vec![PointReport {
                    index: 0,
                    value: PointValue::Analog(464.0)
                }]
            }
        );

        // AND: operate and malformed requests are handled on the same session
        let ack = exchange(&mut reader, &mut writer, r#"{"op":"operate","index":0,"value":true}"#).await;
        assert_eq!(
            ack,
            Response::Ack {
                index: 0,
                status: AckStatus::Success
            }
        );
        assert_eq!(queue.len(), 1);
        let err = exchange(&mut reader, &mut writer, "nonsense").await;
        assert!(matches!(err, Response::Error { .. }));

        outstation.stop().await;
    }

    #[tokio::test]
    async fn enable_is_valid_once() {
        let outstation = provisioner(
            Arc::new(InMemoryTelemetryStore::new()),
            Arc::new(InMemoryInstructionQueue::new(1)),
        )
        .start(spec(0))
        .await
        .unwrap();

        outstation.enable().unwrap();
        assert!(matches!(outstation.enable(), Err(Error::InvalidState(_))));
        outstation.stop().await;
        assert!(matches!(outstation.enable(), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn stop_without_enable_releases_socket() {
        // GIVEN: a provisioned outstation with a parked session
        let outstation = provisioner(
            Arc::new(InMemoryTelemetryStore::new()),
            Arc::new(InMemoryInstructionQueue::new(1)),
        )
        .start(spec(0))
        .await
        .unwrap();
        let addr = outstation.local_addr();
        let mut parked = TcpStream::connect(addr).await.unwrap();

        // WHEN: stopping twice
        outstation.stop().await;
        outstation.stop().await;

        // THEN: the state is terminal, the session is closed and the port is free
        assert_eq!(outstation.state(), BackendState::Stopped);
        let mut buf = String::new();
        let (read, _w) = parked.split();
        let n = BufReader::new(read).read_line(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        TcpListener::bind(addr).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_line_gets_error_then_close() {
        let outstation = provisioner(
            Arc::new(InMemoryTelemetryStore::new()),
            Arc::new(InMemoryInstructionQueue::new(1)),
        )
        .start(spec(0))
        .await
        .unwrap();
        outstation.enable().unwrap();

        let stream = TcpStream::connect(outstation.local_addr()).await.unwrap();
        let (read, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read);

        let long = "x".repeat(1024);
        let response = exchange(&mut reader, &mut writer, &long).await;
        assert!(matches!(response, Response::Error { .. }));

        let mut rest = String::new();
        assert_eq!(reader.read_line(&mut rest).await.unwrap_or(0), 0);
        outstation.stop().await;
    }

    #[tokio::test]
    async fn occupied_port_is_provisioning_failure() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let result = provisioner(
            Arc::new(InMemoryTelemetryStore::new()),
            Arc::new(InMemoryInstructionQueue::new(1)),
        )
        .start(spec(port))
        .await;
        assert!(matches!(result, Err(Error::ProvisioningFailure(_))));
    }
}
