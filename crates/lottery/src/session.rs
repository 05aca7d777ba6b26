use crate::codec::{self, FrameError};
use crate::coordinator::{Coordinator, CoordinatorError, FinishOutcome};
use crate::protocol::{Request, RequestError, Response};
use crate::types::{AgencyId, Bet, WireFormat};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// What to do with the connection after rejecting a malformed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedBatchPolicy {
    /// Reply `error` and keep reading batches.
    #[default]
    Continue,
    /// Reply `error` and close the connection.
    Disconnect,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    pub malformed_batch_policy: MalformedBatchPolicy,
    pub winners_format: WireFormat,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("stream error: {0}")]
    Frame(#[from] FrameError),
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
}

/// Why a session ended without a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the stream between messages.
    PeerClosed,
    /// The agency signaled it has no more bets.
    Exited(AgencyId),
    /// Winners were sent to the agency.
    WinnersSent { agency: AgencyId, count: usize },
    /// A winners query arrived before the draw; `error` was sent.
    DrawPending(AgencyId),
    /// A request was refused and the connection closed.
    Rejected,
}

/// Protocol state machine for one agency connection.
pub struct Session<S> {
    stream: S,
    peer: String,
    coordinator: Arc<Coordinator>,
    config: SessionConfig,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: String, coordinator: Arc<Coordinator>, config: SessionConfig) -> Self {
        Self {
            stream,
            peer,
            coordinator,
            config,
        }
    }

    /// Serve requests until the session ends. Stream errors are returned
    /// without attempting any further write on the stream.
    pub async fn run(mut self) -> Result<SessionEnd, SessionError> {
        let end = loop {
            let payload = match codec::receive_text(&mut self.stream).await {
                Ok(payload) => payload,
                Err(FrameError::ConnectionClosed) => {
                    info!(
                        action = "receive_message",
                        result = "closed",
                        peer = %self.peer,
                        "Connection closed by peer"
                    );
                    return Ok(SessionEnd::PeerClosed);
                }
                Err(FrameError::InvalidUtf8(e)) => {
                    warn!(
                        action = "apuesta_recibida",
                        result = "fail",
                        cantidad = 0,
                        peer = %self.peer,
                        "Payload is not UTF-8: {}",
                        e
                    );
                    match self.reject_batch().await? {
                        ControlFlow::Continue(()) => continue,
                        ControlFlow::Break(end) => break end,
                    }
                }
                Err(e) => return Err(e.into()),
            };

            let flow = match Request::parse(&payload) {
                Ok(Request::Bets(bets)) => self.handle_bets(bets).await?,
                Ok(Request::Exit(agency)) => self.handle_exit(agency).await?,
                Ok(Request::Winners(agency)) => self.handle_winners(agency).await?,
                Err(RequestError::Batch(e)) => {
                    warn!(
                        action = "apuesta_recibida",
                        result = "fail",
                        cantidad = 0,
                        peer = %self.peer,
                        "Rejected batch: {}",
                        e
                    );
                    self.reject_batch().await?
                }
                Err(e @ RequestError::Agency { .. }) => {
                    warn!(peer = %self.peer, "Rejected request: {}", e);
                    self.respond(&Response::Error).await?;
                    ControlFlow::Break(SessionEnd::Rejected)
                }
            };

            if let ControlFlow::Break(end) = flow {
                break end;
            }
        };

        // Best effort: the peer may already be gone.
        let _ = self.stream.shutdown().await;
        Ok(end)
    }

    async fn handle_bets(&mut self, bets: Vec<Bet>) -> Result<ControlFlow<SessionEnd>, SessionError> {
        let agency = bets[0].agency;
        match self.coordinator.store_bets(&bets).await {
            Ok(()) => {
                info!(
                    action = "apuesta_recibida",
                    result = "success",
                    agency = %agency,
                    cantidad = bets.len()
                );
                self.respond(&Response::Success).await?;
                Ok(ControlFlow::Continue(()))
            }
            Err(CoordinatorError::DrawClosed) => {
                warn!(
                    action = "apuesta_recibida",
                    result = "fail",
                    agency = %agency,
                    cantidad = bets.len(),
                    "Draw already held"
                );
                self.reject_batch().await
            }
            Err(e) => {
                error!(
                    action = "apuesta_recibida",
                    result = "fail",
                    agency = %agency,
                    cantidad = bets.len(),
                    "Failed to store batch: {}",
                    e
                );
                // The stream is still healthy, so let the agency know.
                self.respond(&Response::Error).await?;
                Err(e.into())
            }
        }
    }

    async fn handle_exit(&mut self, agency: AgencyId) -> Result<ControlFlow<SessionEnd>, SessionError> {
        match self.coordinator.finish_agency(agency).await {
            Ok(FinishOutcome::Waiting { finished, total }) => {
                info!(
                    action = "agencia_finalizada",
                    result = "success",
                    agency = %agency,
                    "{} of {} agencies finished",
                    finished,
                    total
                );
            }
            Ok(FinishOutcome::DrawHeld { winners }) => {
                info!(
                    action = "agencia_finalizada",
                    result = "success",
                    agency = %agency,
                    "Last agency finished, draw held with {} winners",
                    winners
                );
            }
            Ok(FinishOutcome::AlreadyDrawn) => {
                info!(
                    action = "agencia_finalizada",
                    result = "success",
                    agency = %agency,
                    "Agency finished after the draw"
                );
            }
            Err(e @ CoordinatorError::UnknownAgency(_)) => {
                warn!(action = "agencia_finalizada", result = "fail", agency = %agency, "{}", e);
                return Ok(ControlFlow::Break(SessionEnd::Rejected));
            }
            Err(e) => {
                error!(action = "agencia_finalizada", result = "fail", agency = %agency, "{}", e);
                return Err(e.into());
            }
        }
        Ok(ControlFlow::Break(SessionEnd::Exited(agency)))
    }

    async fn handle_winners(&mut self, agency: AgencyId) -> Result<ControlFlow<SessionEnd>, SessionError> {
        match self.coordinator.winners_for(agency).await {
            Ok(bets) => {
                let documents: Vec<String> = bets.into_iter().map(|bet| bet.document).collect();
                let count = documents.len();
                self.respond(&Response::Winners(documents)).await?;
                info!(
                    action = "consulta_ganadores",
                    result = "success",
                    agency = %agency,
                    cant_ganadores = count
                );
                Ok(ControlFlow::Break(SessionEnd::WinnersSent { agency, count }))
            }
            Err(e @ CoordinatorError::DrawPending { .. }) => {
                info!(action = "consulta_ganadores", result = "fail", agency = %agency, "{}", e);
                self.respond(&Response::Error).await?;
                Ok(ControlFlow::Break(SessionEnd::DrawPending(agency)))
            }
            Err(e @ CoordinatorError::UnknownAgency(_)) => {
                warn!(action = "consulta_ganadores", result = "fail", agency = %agency, "{}", e);
                self.respond(&Response::Error).await?;
                Ok(ControlFlow::Break(SessionEnd::Rejected))
            }
            Err(e) => {
                error!(action = "consulta_ganadores", result = "fail", agency = %agency, "{}", e);
                self.respond(&Response::Error).await?;
                Err(e.into())
            }
        }
    }

    async fn reject_batch(&mut self) -> Result<ControlFlow<SessionEnd>, SessionError> {
        self.respond(&Response::Error).await?;
        match self.config.malformed_batch_policy {
            MalformedBatchPolicy::Continue => Ok(ControlFlow::Continue(())),
            MalformedBatchPolicy::Disconnect => Ok(ControlFlow::Break(SessionEnd::Rejected)),
        }
    }

    async fn respond(&mut self, response: &Response) -> Result<(), FrameError> {
        let payload = response.encode(self.config.winners_format);
        codec::send_text(&mut self.stream, &payload).await
    }
}

/// Run a session to completion and log how it ended. This is the handler
/// boundary: nothing a single connection does escapes it.
pub async fn serve<S>(stream: S, peer: String, coordinator: Arc<Coordinator>, config: SessionConfig)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session = Session::new(stream, peer.clone(), coordinator, config);
    match session.run().await {
        Ok(end) => debug!(peer = %peer, "Session ended: {:?}", end),
        Err(SessionError::Frame(FrameError::ConnectionClosed)) => {
            info!(peer = %peer, "Client disconnected");
        }
        Err(e) => error!(peer = %peer, "Session error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::Trickle;
    use crate::coordinator::DrawPolicy;
    use crate::storage::{BetStore, MemoryBetStore};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    const WINNING: u32 = 7574;

    struct Harness {
        coordinator: Arc<Coordinator>,
        store: Arc<MemoryBetStore>,
    }

    impl Harness {
        fn new(agencies: u32) -> Self {
            let store = Arc::new(MemoryBetStore::new());
            let coordinator = Arc::new(Coordinator::new(
                agencies,
                store.clone(),
                DrawPolicy::new(WINNING),
            ));
            Self { coordinator, store }
        }

        fn connect(
            &self,
            config: SessionConfig,
        ) -> (DuplexStream, JoinHandle<Result<SessionEnd, SessionError>>) {
            let (client, server) = tokio::io::duplex(1024);
            let session = Session::new(
                server,
                "test-peer".to_string(),
                Arc::clone(&self.coordinator),
                config,
            );
            (client, tokio::spawn(session.run()))
        }
    }

    async fn request(client: &mut DuplexStream, payload: &str) -> String {
        codec::send_text(client, payload).await.unwrap();
        codec::receive_text(client).await.unwrap()
    }

    fn record(agency: u32, document: &str, number: u32) -> String {
        format!("{agency};Ana;Diaz;{document};1985-01-30;{number};")
    }

    #[tokio::test]
    async fn test_batches_then_exit() {
        let harness = Harness::new(2);
        let (mut client, session) = harness.connect(SessionConfig::default());

        let batch = format!("{}{}", record(1, "10", 1), record(1, "11", WINNING));
        assert_eq!(request(&mut client, &batch).await, "success");
        assert_eq!(request(&mut client, &record(1, "12", 3)).await, "success");
        codec::send_text(&mut client, "exit1").await.unwrap();

        let end = session.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Exited(AgencyId::new(1).unwrap()));
        assert_eq!(harness.store.count().unwrap(), 3);
        assert_eq!(harness.coordinator.finished_count().await, 1);

        // The server closed its side after the exit signal.
        assert!(matches!(
            codec::receive_message(&mut client).await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_malformed_batch_continue_policy() {
        let harness = Harness::new(1);
        let (mut client, session) = harness.connect(SessionConfig::default());

        assert_eq!(request(&mut client, "not a bet").await, "error");
        assert_eq!(harness.store.count().unwrap(), 0);
        assert_eq!(request(&mut client, &record(1, "10", 1)).await, "success");
        drop(client);

        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::PeerClosed);
        assert_eq!(harness.store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_batch_disconnect_policy() {
        let harness = Harness::new(1);
        let config = SessionConfig {
            malformed_batch_policy: MalformedBatchPolicy::Disconnect,
            ..SessionConfig::default()
        };
        let (mut client, session) = harness.connect(config);

        assert_eq!(
            request(&mut client, "1;Ana;Diaz;10;1985-02-30;1;").await,
            "error"
        );
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::Rejected);
        assert_eq!(harness.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_utf8_payload_is_a_malformed_batch() {
        let harness = Harness::new(1);
        let (mut client, session) = harness.connect(SessionConfig::default());

        codec::send_message(&mut client, &[0xFF, 0xFE]).await.unwrap();
        assert_eq!(codec::receive_text(&mut client).await.unwrap(), "error");
        assert_eq!(request(&mut client, &record(1, "10", 1)).await, "success");
        drop(client);
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_winners_before_draw_is_an_error() {
        let harness = Harness::new(2);
        let (mut client, session) = harness.connect(SessionConfig::default());

        assert_eq!(request(&mut client, "winners1").await, "error");
        assert_eq!(
            session.await.unwrap().unwrap(),
            SessionEnd::DrawPending(AgencyId::new(1).unwrap())
        );
    }

    #[tokio::test]
    async fn test_winners_after_draw() {
        let harness = Harness::new(2);
        for (agency, document, number) in [(1, "10", 5), (2, "20", WINNING), (2, "21", WINNING)] {
            let (mut client, session) = harness.connect(SessionConfig::default());
            assert_eq!(
                request(&mut client, &record(agency, document, number)).await,
                "success"
            );
            drop(client);
            session.await.unwrap().unwrap();
        }
        for agency in 1..=2 {
            let (mut client, session) = harness.connect(SessionConfig::default());
            codec::send_text(&mut client, &format!("exit{agency}")).await.unwrap();
            session.await.unwrap().unwrap();
        }

        let (mut client, _) = harness.connect(SessionConfig::default());
        assert_eq!(request(&mut client, "winners1").await, "[]");

        let config = SessionConfig {
            winners_format: WireFormat::Text,
            ..SessionConfig::default()
        };
        let (mut client, session) = harness.connect(config);
        assert_eq!(request(&mut client, "winners2").await, "20;21");
        assert_eq!(
            session.await.unwrap().unwrap(),
            SessionEnd::WinnersSent {
                agency: AgencyId::new(2).unwrap(),
                count: 2
            }
        );
    }

    #[tokio::test]
    async fn test_bets_after_draw_are_refused() {
        let harness = Harness::new(1);
        let (mut client, session) = harness.connect(SessionConfig::default());
        codec::send_text(&mut client, "exit1").await.unwrap();
        session.await.unwrap().unwrap();

        let (mut client, _) = harness.connect(SessionConfig::default());
        assert_eq!(request(&mut client, &record(1, "10", WINNING)).await, "error");
        assert_eq!(harness.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bad_agency_requests_are_rejected() {
        let harness = Harness::new(2);

        let (mut client, session) = harness.connect(SessionConfig::default());
        assert_eq!(request(&mut client, "winnersabc").await, "error");
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::Rejected);

        let (mut client, session) = harness.connect(SessionConfig::default());
        codec::send_text(&mut client, "exit9").await.unwrap();
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::Rejected);
        assert_eq!(harness.coordinator.finished_count().await, 0);
    }

    #[tokio::test]
    async fn test_truncated_frame_stores_nothing() {
        let harness = Harness::new(1);
        let (mut client, session) = harness.connect(SessionConfig::default());

        // Declares 64 bytes, delivers 2, then the peer goes away.
        client.write_all(&[0x00, 0x40, b'1', b';']).await.unwrap();
        drop(client);

        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::PeerClosed);
        assert_eq!(harness.store.count().unwrap(), 0);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_peer_gone_mid_frame_is_logged_at_info() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let harness = Harness::new(1);
        let (mut client, session) = harness.connect(SessionConfig::default());
        client.write_all(&[0x00, 0x20, b'1']).await.unwrap();
        drop(client);
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::PeerClosed);

        let output = logs.contents();
        assert!(output.contains("INFO"), "{output}");
        assert!(output.contains("action=\"receive_message\""), "{output}");
        assert!(output.contains("peer=test-peer"), "{output}");
    }

    #[tokio::test]
    async fn test_one_byte_at_a_time_client() {
        let harness = Harness::new(1);
        let (client, server) = tokio::io::duplex(16);
        let session = tokio::spawn(
            Session::new(
                server,
                "trickle".to_string(),
                Arc::clone(&harness.coordinator),
                SessionConfig::default(),
            )
            .run(),
        );

        let mut client = Trickle::new(client);
        codec::send_text(&mut client, &record(1, "10", WINNING)).await.unwrap();
        assert_eq!(codec::receive_text(&mut client).await.unwrap(), "success");
        codec::send_text(&mut client, "exit1").await.unwrap();
        session.await.unwrap().unwrap();

        assert!(harness.coordinator.is_draw_complete().await);
    }
}
