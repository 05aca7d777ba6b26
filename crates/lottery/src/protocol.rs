use crate::types::{AgencyId, Bet, BetParseError, WireFormat, parse_batch};
use thiserror::Error;

pub const SUCCESS: &str = "success";
pub const ERROR: &str = "error";
pub const EXIT_PREFIX: &str = "exit";
pub const WINNERS_PREFIX: &str = "winners";

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed bet batch: {0}")]
    Batch(#[from] BetParseError),
    #[error("malformed {command} request: bad agency id '{raw}'")]
    Agency { command: &'static str, raw: String },
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Bets(Vec<Bet>),
    Exit(AgencyId),
    Winners(AgencyId),
}

impl Request {
    /// Classify a payload by prefix. Anything that is neither an exit
    /// signal nor a winners query is parsed as a bet batch.
    pub fn parse(payload: &str) -> Result<Request, RequestError> {
        if let Some(rest) = payload.strip_prefix(WINNERS_PREFIX) {
            return parse_agency(WINNERS_PREFIX, rest).map(Request::Winners);
        }
        if let Some(rest) = payload.strip_prefix(EXIT_PREFIX) {
            return parse_agency(EXIT_PREFIX, rest).map(Request::Exit);
        }
        Ok(Request::Bets(parse_batch(payload)?))
    }

    /// Encode a control request. Batches are built by the client, which
    /// needs to size them against the frame limit.
    pub fn exit(agency: AgencyId) -> String {
        format!("{EXIT_PREFIX}{agency}")
    }

    pub fn winners(agency: AgencyId) -> String {
        format!("{WINNERS_PREFIX}{agency}")
    }
}

fn parse_agency(command: &'static str, raw: &str) -> Result<AgencyId, RequestError> {
    raw.parse().map_err(|_| RequestError::Agency {
        command,
        raw: raw.to_string(),
    })
}

/// A server reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success,
    Error,
    /// Document identifiers of an agency's winning bets.
    Winners(Vec<String>),
}

impl Response {
    pub fn encode(&self, format: WireFormat) -> String {
        match self {
            Response::Success => SUCCESS.to_string(),
            Response::Error => ERROR.to_string(),
            Response::Winners(documents) => match format {
                WireFormat::Json => serde_json::Value::from(documents.clone()).to_string(),
                WireFormat::Text => documents.join(";"),
            },
        }
    }

    /// Decode a reply as the client sees it. Anything that is not a status
    /// token is a winners list in `format`.
    pub fn decode(payload: &str, format: WireFormat) -> Result<Response, serde_json::Error> {
        match payload {
            SUCCESS => Ok(Response::Success),
            ERROR => Ok(Response::Error),
            list => match format {
                WireFormat::Json => Ok(Response::Winners(serde_json::from_str(list)?)),
                WireFormat::Text => Ok(Response::Winners(
                    list.split(';')
                        .map(str::trim)
                        .filter(|d| !d.is_empty())
                        .map(str::to_string)
                        .collect(),
                )),
            },
        }
    }
}
