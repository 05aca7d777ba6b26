use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of fields in one textual bet record.
pub const BET_FIELDS: usize = 6;

#[derive(Debug, Error)]
pub enum BetParseError {
    #[error("empty bet batch")]
    EmptyBatch,
    #[error("record {record} has {found} fields, expected 6")]
    FieldCount { record: usize, found: usize },
    #[error("missing value for field '{0}'")]
    MissingField(&'static str),
    #[error("invalid agency id '{0}'")]
    InvalidAgency(String),
    #[error("invalid bet number '{0}'")]
    InvalidNumber(String),
    #[error("invalid birth date '{0}'")]
    InvalidBirthDate(String),
    #[error("invalid JSON batch: {0}")]
    Json(#[from] serde_json::Error),
}

/// Identifier of a lottery agency. Always >= 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct AgencyId(u32);

impl AgencyId {
    pub fn new(id: u32) -> Result<Self, BetParseError> {
        if id == 0 {
            return Err(BetParseError::InvalidAgency(id.to_string()));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for AgencyId {
    type Error = BetParseError;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<AgencyId> for u32 {
    fn from(id: AgencyId) -> Self {
        id.0
    }
}

impl fmt::Display for AgencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AgencyId {
    type Err = BetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s
            .trim()
            .parse::<u32>()
            .map_err(|_| BetParseError::InvalidAgency(s.to_string()))?;
        Self::new(id).map_err(|_| BetParseError::InvalidAgency(s.to_string()))
    }
}

/// Calendar date in ISO `YYYY-MM-DD` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BirthDate {
    year: u16,
    month: u8,
    day: u8,
}

impl BirthDate {
    pub fn new(year: u16, month: u8, day: u8) -> Option<Self> {
        if !(1..=12).contains(&month) || day == 0 || day > days_in_month(year, month) {
            return None;
        }
        Some(Self { year, month, day })
    }
}

fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        2 if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

impl fmt::Display for BirthDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl FromStr for BirthDate {
    type Err = BetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BetParseError::InvalidBirthDate(s.to_string());

        let parts: Vec<&str> = s.trim().split('-').collect();
        let [year, month, day] = parts.as_slice() else {
            return Err(invalid());
        };
        if year.len() != 4 || month.len() != 2 || day.len() != 2 {
            return Err(invalid());
        }
        if !parts.iter().all(|p| p.bytes().all(|b| b.is_ascii_digit())) {
            return Err(invalid());
        }

        let year = year.parse().map_err(|_| invalid())?;
        let month = month.parse().map_err(|_| invalid())?;
        let day = day.parse().map_err(|_| invalid())?;
        Self::new(year, month, day).ok_or_else(invalid)
    }
}

/// A single lottery entry placed through an agency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bet {
    pub agency: AgencyId,
    pub first_name: String,
    pub last_name: String,
    pub document: String,
    pub birthdate: BirthDate,
    pub number: u32,
}

impl Bet {
    /// Build a bet from its six textual fields, in wire order:
    /// agency, first name, last name, document, birth date, number.
    pub fn from_fields(fields: &[&str]) -> Result<Self, BetParseError> {
        let [agency, first_name, last_name, document, birthdate, number] = fields else {
            return Err(BetParseError::FieldCount {
                record: 0,
                found: fields.len(),
            });
        };

        let number = number.trim();
        Ok(Self {
            agency: agency.parse()?,
            first_name: required("first_name", first_name)?,
            last_name: required("last_name", last_name)?,
            document: required("document", document)?,
            birthdate: birthdate.parse()?,
            number: number
                .parse()
                .map_err(|_| BetParseError::InvalidNumber(number.to_string()))?,
        })
    }

    /// Textual record with every field terminated by `;`.
    pub fn to_record(&self) -> String {
        format!(
            "{};{};{};{};{};{};",
            self.agency, self.first_name, self.last_name, self.document, self.birthdate, self.number
        )
    }
}

fn required(name: &'static str, value: &str) -> Result<String, BetParseError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BetParseError::MissingField(name));
    }
    Ok(value.to_string())
}

/// JSON shape of a bet on the wire. Agencies historically send every
/// value as a string with Spanish keys; English keys and bare numbers are
/// accepted as well.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireBet {
    #[serde(rename = "id", alias = "agency")]
    agency: WireValue,
    #[serde(rename = "nombre", alias = "first_name")]
    first_name: WireValue,
    #[serde(rename = "apellido", alias = "last_name")]
    last_name: WireValue,
    #[serde(rename = "documento", alias = "document")]
    document: WireValue,
    #[serde(rename = "nacimiento", alias = "birthdate")]
    birthdate: WireValue,
    #[serde(rename = "numero", alias = "number")]
    number: WireValue,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireValue {
    Text(String),
    Integer(i64),
}

impl WireValue {
    fn into_text(self) -> String {
        match self {
            WireValue::Text(s) => s,
            WireValue::Integer(n) => n.to_string(),
        }
    }
}

impl From<&Bet> for WireBet {
    fn from(bet: &Bet) -> Self {
        Self {
            agency: WireValue::Text(bet.agency.to_string()),
            first_name: WireValue::Text(bet.first_name.clone()),
            last_name: WireValue::Text(bet.last_name.clone()),
            document: WireValue::Text(bet.document.clone()),
            birthdate: WireValue::Text(bet.birthdate.to_string()),
            number: WireValue::Text(bet.number.to_string()),
        }
    }
}

impl TryFrom<WireBet> for Bet {
    type Error = BetParseError;

    fn try_from(wire: WireBet) -> Result<Self, Self::Error> {
        let fields = [
            wire.agency.into_text(),
            wire.first_name.into_text(),
            wire.last_name.into_text(),
            wire.document.into_text(),
            wire.birthdate.into_text(),
            wire.number.into_text(),
        ];
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        Bet::from_fields(&refs)
    }
}

/// Parse a bet batch payload. A payload starting with `[` is a JSON array
/// of bet objects; anything else is the `;`/newline delimited text form.
/// Either every record is valid or the whole batch is rejected.
pub fn parse_batch(payload: &str) -> Result<Vec<Bet>, BetParseError> {
    let payload = payload.trim();
    if payload.starts_with('[') {
        parse_json_batch(payload)
    } else {
        parse_text_batch(payload)
    }
}

fn parse_json_batch(payload: &str) -> Result<Vec<Bet>, BetParseError> {
    let wire: Vec<WireBet> = serde_json::from_str(payload)?;
    if wire.is_empty() {
        return Err(BetParseError::EmptyBatch);
    }
    wire.into_iter().map(Bet::try_from).collect()
}

fn parse_text_batch(payload: &str) -> Result<Vec<Bet>, BetParseError> {
    let mut fields = Vec::new();
    for line in payload.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let line = line.strip_suffix(';').unwrap_or(line);
        fields.extend(line.split(';'));
    }
    if fields.is_empty() {
        return Err(BetParseError::EmptyBatch);
    }

    fields
        .chunks(BET_FIELDS)
        .enumerate()
        .map(|(i, record)| {
            if record.len() != BET_FIELDS {
                return Err(BetParseError::FieldCount {
                    record: i,
                    found: record.len(),
                });
            }
            Bet::from_fields(record)
        })
        .collect()
}

/// Serialization used for outgoing batches and winners lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "text" => Ok(WireFormat::Text),
            other => Err(format!("unknown wire format '{other}' (expected json or text)")),
        }
    }
}

/// Encode one bet the way it appears inside a batch of `format`.
pub fn encode_bet(bet: &Bet, format: WireFormat) -> Result<String, serde_json::Error> {
    match format {
        WireFormat::Json => serde_json::to_string(&WireBet::from(bet)),
        WireFormat::Text => Ok(bet.to_record()),
    }
}

/// Join already-encoded bets into a batch payload.
pub fn join_batch(encoded: &[String], format: WireFormat) -> String {
    match format {
        WireFormat::Json => format!("[{}]", encoded.join(",")),
        WireFormat::Text => encoded.concat(),
    }
}

/// Bytes the batch framing adds around `count` encoded bets.
pub fn batch_overhead(count: usize, format: WireFormat) -> usize {
    match format {
        WireFormat::Json => 2 + count.saturating_sub(1),
        WireFormat::Text => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bet(agency: u32, document: &str, number: u32) -> Bet {
        Bet {
            agency: AgencyId::new(agency).unwrap(),
            first_name: "Santiago Lionel".to_string(),
            last_name: "Lorca".to_string(),
            document: document.to_string(),
            birthdate: BirthDate::new(1999, 3, 17).unwrap(),
            number,
        }
    }

    #[test]
    fn test_agency_id_rejects_zero() {
        assert!(AgencyId::new(0).is_err());
        assert!("0".parse::<AgencyId>().is_err());
        assert!("-3".parse::<AgencyId>().is_err());
        assert_eq!("12".parse::<AgencyId>().unwrap().get(), 12);
    }

    #[test]
    fn test_birth_date_validation() {
        assert_eq!(
            "2000-02-29".parse::<BirthDate>().unwrap(),
            BirthDate::new(2000, 2, 29).unwrap()
        );
        assert!("1900-02-29".parse::<BirthDate>().is_err());
        assert!("1999-13-01".parse::<BirthDate>().is_err());
        assert!("1999-04-31".parse::<BirthDate>().is_err());
        assert!("99-04-01".parse::<BirthDate>().is_err());
        assert!("1999-4-01".parse::<BirthDate>().is_err());
        assert!("1999-+4-01".parse::<BirthDate>().is_err());
        assert_eq!(
            "1987-11-05".parse::<BirthDate>().unwrap().to_string(),
            "1987-11-05"
        );
    }

    #[test]
    fn test_parse_text_batch_semicolon_terminated() {
        let payload = "1;Santiago Lionel;Lorca;30904465;1999-03-17;7574;\
                       1;Ana;Diaz;29100200;1985-01-30;12;";
        let bets = parse_batch(payload).unwrap();
        assert_eq!(bets.len(), 2);
        assert_eq!(bets[0], bet(1, "30904465", 7574));
        assert_eq!(bets[1].first_name, "Ana");
        assert_eq!(bets[1].number, 12);
    }

    #[test]
    fn test_parse_text_batch_one_record_per_line() {
        let payload = "2;Ana;Diaz;29100200;1985-01-30;12\r\n3;Luis;Paz;1234;1970-06-01;7574;\n";
        let bets = parse_batch(payload).unwrap();
        assert_eq!(bets.len(), 2);
        assert_eq!(bets[0].agency.get(), 2);
        assert_eq!(bets[1].agency.get(), 3);
        assert_eq!(bets[1].document, "1234");
    }

    #[test]
    fn test_parse_json_batch_spanish_keys() {
        let payload = r#"[{"id":"4","nombre":"Ana","apellido":"Diaz","documento":"29100200","nacimiento":"1985-01-30","numero":"7574"}]"#;
        let bets = parse_batch(payload).unwrap();
        assert_eq!(bets.len(), 1);
        assert_eq!(bets[0].agency.get(), 4);
        assert_eq!(bets[0].number, 7574);
    }

    #[test]
    fn test_parse_json_batch_english_keys_and_numbers() {
        let payload = r#"[{"agency":2,"first_name":"Ana","last_name":"Diaz","document":29100200,"birthdate":"1985-01-30","number":41}]"#;
        let bets = parse_batch(payload).unwrap();
        assert_eq!(bets[0].document, "29100200");
        assert_eq!(bets[0].number, 41);
    }

    #[test]
    fn test_malformed_batches_are_rejected() {
        assert!(matches!(parse_batch(""), Err(BetParseError::EmptyBatch)));
        assert!(matches!(parse_batch("[]"), Err(BetParseError::EmptyBatch)));
        assert!(matches!(
            parse_batch("1;Ana;Diaz;1;1985-01-30;"),
            Err(BetParseError::FieldCount { record: 0, found: 5 })
        ));
        assert!(matches!(
            parse_batch("1;Ana;Diaz;1;1985-01-30;seven;"),
            Err(BetParseError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_batch("1;;Diaz;1;1985-01-30;7;"),
            Err(BetParseError::MissingField("first_name"))
        ));
        assert!(matches!(
            parse_batch("0;Ana;Diaz;1;1985-01-30;7;"),
            Err(BetParseError::InvalidAgency(_))
        ));
        assert!(matches!(
            parse_batch("[{\"id\":\"1\"}]"),
            Err(BetParseError::Json(_))
        ));
    }

    #[test]
    fn test_one_bad_record_rejects_the_whole_batch() {
        let payload = "1;Ana;Diaz;1;1985-01-30;7;1;Luis;Paz;2;1985-02-30;8;";
        assert!(matches!(
            parse_batch(payload),
            Err(BetParseError::InvalidBirthDate(_))
        ));
    }

    #[test]
    fn test_encoded_batches_parse_back() {
        let bets = vec![bet(1, "100", 7574), bet(3, "200", 1)];
        for format in [WireFormat::Json, WireFormat::Text] {
            let encoded: Vec<String> = bets.iter().map(|b| encode_bet(b, format).unwrap()).collect();
            let payload = join_batch(&encoded, format);
            let expected_len: usize = encoded.iter().map(String::len).sum::<usize>()
                + batch_overhead(encoded.len(), format);
            assert_eq!(payload.len(), expected_len);
            assert_eq!(parse_batch(&payload).unwrap(), bets);
        }
    }

    proptest! {
        #[test]
        fn text_records_survive_parsing(
            agency in 1u32..1000,
            document in "[0-9]{7,8}",
            first in "[A-Za-z]{1,12}( [A-Za-z]{1,12})?",
            number in 0u32..10000,
        ) {
            let original = Bet {
                agency: AgencyId::new(agency).unwrap(),
                first_name: first,
                last_name: "Lorca".to_string(),
                document,
                birthdate: BirthDate::new(1990, 12, 31).unwrap(),
                number,
            };
            let parsed = parse_batch(&original.to_record()).unwrap();
            prop_assert_eq!(parsed, vec![original]);
        }
    }
}
