use crate::codec::{self, FrameError, MAX_PAYLOAD_SIZE};
use crate::protocol::{Request, Response};
use crate::types::{AgencyId, Bet, BetParseError, WireFormat, batch_overhead, encode_bet, join_batch};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream error: {0}")]
    Frame(#[from] FrameError),
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("server rejected batch {batch}")]
    Rejected { batch: usize },
    #[error("unexpected response from server: {0}")]
    UnexpectedResponse(String),
    #[error("winners not available after {attempts} attempts")]
    WinnersUnavailable { attempts: u32 },
    #[error("line {line}: {source}")]
    BetFile { line: usize, source: BetParseError },
}

/// How `wait_for_winners` polls a server whose draw is still pending.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            delay: Duration::from_secs(1),
        }
    }
}

/// Client side of the agency protocol.
#[derive(Debug, Clone)]
pub struct AgencyClient {
    server_addr: String,
    agency: AgencyId,
    format: WireFormat,
}

impl AgencyClient {
    pub fn new(server_addr: impl Into<String>, agency: AgencyId, format: WireFormat) -> Self {
        Self {
            server_addr: server_addr.into(),
            agency,
            format,
        }
    }

    pub async fn connect(&self) -> Result<AgencyConnection, ClientError> {
        let stream = TcpStream::connect(&self.server_addr).await?;
        debug!(agency = %self.agency, "Connected to {}", self.server_addr);
        Ok(AgencyConnection {
            stream,
            agency: self.agency,
            format: self.format,
        })
    }

    /// Send every bet in batches of at most `batch_size`, then signal exit.
    /// Returns the number of batches sent.
    pub async fn submit(&self, bets: &[Bet], batch_size: usize) -> Result<usize, ClientError> {
        let mut conn = self.connect().await?;
        let batches = conn.send_bets(bets, batch_size).await?;
        conn.exit().await?;
        Ok(batches)
    }

    /// Ask for this agency's winners once. `None` means the draw has not
    /// been held yet.
    pub async fn query_winners(&self) -> Result<Option<Vec<String>>, ClientError> {
        self.connect().await?.query_winners().await
    }

    /// Poll until the draw has been held, reconnecting for every attempt.
    pub async fn wait_for_winners(&self, retry: RetryPolicy) -> Result<Vec<String>, ClientError> {
        for attempt in 1..=retry.attempts {
            if let Some(winners) = self.query_winners().await? {
                return Ok(winners);
            }
            debug!(agency = %self.agency, attempt, "Draw pending, retrying");
            tokio::time::sleep(retry.delay).await;
        }
        Err(ClientError::WinnersUnavailable {
            attempts: retry.attempts,
        })
    }
}

/// An open connection to the server on behalf of one agency.
pub struct AgencyConnection {
    stream: TcpStream,
    agency: AgencyId,
    format: WireFormat,
}

impl AgencyConnection {
    pub async fn send_bets(&mut self, bets: &[Bet], batch_size: usize) -> Result<usize, ClientError> {
        let batches = encode_batches(bets, batch_size, self.format)?;
        for (i, batch) in batches.iter().enumerate() {
            codec::send_text(&mut self.stream, batch).await?;
            let reply = codec::receive_text(&mut self.stream).await?;
            match Response::decode(&reply, self.format) {
                Ok(Response::Success) => {}
                Ok(Response::Error) => {
                    warn!(
                        action = "apuesta_enviada",
                        result = "fail",
                        agency = %self.agency,
                        batch = i
                    );
                    return Err(ClientError::Rejected { batch: i });
                }
                _ => return Err(ClientError::UnexpectedResponse(reply)),
            }
        }
        info!(
            action = "apuesta_enviada",
            result = "success",
            agency = %self.agency,
            cantidad = bets.len(),
            batches = batches.len()
        );
        Ok(batches.len())
    }

    /// Tell the server this agency has no more bets. Consumes the
    /// connection; the server closes it.
    pub async fn exit(mut self) -> Result<(), ClientError> {
        codec::send_text(&mut self.stream, &Request::exit(self.agency)).await?;
        Ok(())
    }

    pub async fn query_winners(mut self) -> Result<Option<Vec<String>>, ClientError> {
        codec::send_text(&mut self.stream, &Request::winners(self.agency)).await?;
        let reply = codec::receive_text(&mut self.stream).await?;
        match Response::decode(&reply, self.format) {
            Ok(Response::Winners(documents)) => Ok(Some(documents)),
            Ok(Response::Error) => Ok(None),
            _ => Err(ClientError::UnexpectedResponse(reply)),
        }
    }
}

/// Split `bets` into batch payloads of at most `max_bets` records that each
/// fit in one frame. A record that would overflow the current payload starts
/// the next one.
pub fn encode_batches(
    bets: &[Bet],
    max_bets: usize,
    format: WireFormat,
) -> Result<Vec<String>, ClientError> {
    let max_bets = max_bets.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0;

    for bet in bets {
        let encoded = encode_bet(bet, format)?;
        let single = encoded.len() + batch_overhead(1, format);
        if single > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(single).into());
        }

        let grown = current_len + encoded.len() + batch_overhead(current.len() + 1, format);
        if !current.is_empty() && (current.len() == max_bets || grown > MAX_PAYLOAD_SIZE) {
            batches.push(join_batch(&current, format));
            current.clear();
            current_len = 0;
        }
        current_len += encoded.len();
        current.push(encoded);
    }
    if !current.is_empty() {
        batches.push(join_batch(&current, format));
    }
    Ok(batches)
}

/// Load an agency's bets from a CSV file with one
/// `first_name,last_name,document,birthdate,number` record per line.
pub fn read_bets_csv(path: impl AsRef<Path>, agency: AgencyId) -> Result<Vec<Bet>, ClientError> {
    let contents = std::fs::read_to_string(path)?;
    let agency = agency.to_string();

    let mut bets = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = vec![agency.as_str()];
        fields.extend(line.split(','));
        let bet = Bet::from_fields(&fields).map_err(|source| ClientError::BetFile {
            line: i + 1,
            source,
        })?;
        bets.push(bet);
    }
    Ok(bets)
}
