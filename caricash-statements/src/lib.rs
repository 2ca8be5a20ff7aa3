#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;

use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::Utc;
use csv::StringRecord;
use serde::Deserialize;
use serde::Serialize;

use caricash_lifecycle::ExternalTransferState;
use caricash_lifecycle::LifecycleError;
use caricash_lifecycle::StatementEntryState;
use caricash_lifecycle::validate as validate_transition;
use caricash_money::Amount;
use caricash_money::Currency;
use caricash_money::sha256_hex;

pub type StatementsResult<T> = Result<T, StatementsError>;

#[derive(Debug, thiserror::Error)]
pub enum StatementsError {
    #[error("missing column {0}")]
    MissingColumn(String),
    #[error("csv error: {0}")]
    Csv(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid payload: {0}")]
    Invalid(String),
    #[error(transparent)]
    InvalidTransition(#[from] LifecycleError),
}

fn default_timestamp_format() -> String {
    "%Y-%m-%d %H:%M:%S".into()
}

/// One normalized line from a bank statement feed. Currency is restricted
/// to the platform set at parse time, so reconciliation never sees a
/// foreign code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementEntry {
    pub id: String,
    pub bank_account: String,
    pub booked_at: DateTime<Utc>,
    pub amount: Amount,
    pub currency: Currency,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_reference: Option<String>,
    pub checksum: String,
    pub state: StatementEntryState,
}

impl StatementEntry {
    pub fn transition(&mut self, to: StatementEntryState) -> StatementsResult<()> {
        validate_transition(self.state, to)?;
        self.state = to;
        Ok(())
    }

    /// Banks re-send lines across feed pulls. A repeat carries the same
    /// entry reference; without one, the same account booking the same
    /// amount at the same instant is treated as the same line.
    fn dedupe_key(&self) -> String {
        match &self.entry_reference {
            Some(reference) => format!("ref:{reference}"),
            None => format!(
                "line:{}:{}:{}",
                self.bank_account,
                self.booked_at.timestamp(),
                self.amount
            ),
        }
    }

    fn compute_checksum(&self) -> String {
        sha256_hex(format!(
            "{}|{}|{}|{}",
            self.id, self.bank_account, self.booked_at, self.amount
        ))
    }
}

/// Outbound transfer as tracked against the provider; the reconciliation
/// engine matches statement entries to these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTransfer {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_transfer_id: Option<String>,
    pub client_reference: String,
    pub amount: Amount,
    pub currency: Currency,
    pub initiated_at: DateTime<Utc>,
    pub state: ExternalTransferState,
}

impl ExternalTransfer {
    pub fn transition(&mut self, to: ExternalTransferState) -> StatementsResult<()> {
        validate_transition(self.state, to)?;
        self.state = to;
        Ok(())
    }
}

/// A feed line discarded as a repeat, reported against the entry that
/// absorbed it so the ingestion log stays traceable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedDuplicate {
    pub entry_id: String,
    pub kept_entry_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupeOutcome {
    pub entries: Vec<StatementEntry>,
    pub dropped: Vec<DroppedDuplicate>,
}

/// Drops repeats of lines already seen earlier in the feed. First
/// occurrences stay where they arrived; nothing is grouped or reordered.
#[must_use]
pub fn dedupe_entries(entries: Vec<StatementEntry>) -> DedupeOutcome {
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<StatementEntry> = Vec::with_capacity(entries.len());
    let mut dropped = Vec::new();
    for entry in entries {
        let key = entry.dedupe_key();
        match first_seen.get(&key) {
            Some(&position) => dropped.push(DroppedDuplicate {
                entry_id: entry.id,
                kept_entry_id: kept[position].id.clone(),
            }),
            None => {
                first_seen.insert(key, kept.len());
                kept.push(entry);
            }
        }
    }
    DedupeOutcome {
        entries: kept,
        dropped,
    }
}

/// Column mapping for one bank's CSV export.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CsvStatementProfile {
    pub entry_id: String,
    pub bank_account: String,
    pub booked_at: String,
    pub amount: String,
    pub currency: String,
    pub description: String,
    #[serde(default)]
    pub entry_reference: Option<String>,
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
}

impl Default for CsvStatementProfile {
    fn default() -> Self {
        Self {
            entry_id: "entry_id".into(),
            bank_account: "bank_account".into(),
            booked_at: "booked_at".into(),
            amount: "amount".into(),
            currency: "currency".into(),
            description: "description".into(),
            entry_reference: Some("reference".into()),
            timestamp_format: default_timestamp_format(),
        }
    }
}

/// The statement fields a feed must supply, independent of what the bank
/// calls its headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    EntryId,
    BankAccount,
    BookedAt,
    Amount,
    Currency,
    Description,
    Reference,
}

impl Column {
    const ALL: [Column; 7] = [
        Column::EntryId,
        Column::BankAccount,
        Column::BookedAt,
        Column::Amount,
        Column::Currency,
        Column::Description,
        Column::Reference,
    ];

    fn label(self) -> &'static str {
        match self {
            Column::EntryId => "entry_id",
            Column::BankAccount => "bank_account",
            Column::BookedAt => "booked_at",
            Column::Amount => "amount",
            Column::Currency => "currency",
            Column::Description => "description",
            Column::Reference => "entry_reference",
        }
    }

    fn header(self, profile: &CsvStatementProfile) -> Option<&str> {
        match self {
            Column::EntryId => Some(&profile.entry_id),
            Column::BankAccount => Some(&profile.bank_account),
            Column::BookedAt => Some(&profile.booked_at),
            Column::Amount => Some(&profile.amount),
            Column::Currency => Some(&profile.currency),
            Column::Description => Some(&profile.description),
            Column::Reference => profile.entry_reference.as_deref(),
        }
    }
}

/// Header positions resolved once per feed, in a single pass over the
/// header row. Every column the profile names must be present; the
/// reference column may still be empty on individual records.
struct ColumnMap {
    positions: HashMap<Column, usize>,
}

impl ColumnMap {
    fn resolve(profile: &CsvStatementProfile, headers: &StringRecord) -> StatementsResult<Self> {
        let mut positions = HashMap::new();
        for (position, header) in headers.iter().enumerate() {
            for column in Column::ALL {
                if column
                    .header(profile)
                    .is_some_and(|name| name.eq_ignore_ascii_case(header))
                {
                    positions.entry(column).or_insert(position);
                }
            }
        }
        for column in Column::ALL {
            if let Some(name) = column.header(profile)
                && !positions.contains_key(&column)
            {
                return Err(StatementsError::MissingColumn(name.into()));
            }
        }
        Ok(Self { positions })
    }

    fn get<'a>(&self, record: &'a StringRecord, column: Column) -> Option<&'a str> {
        self.positions
            .get(&column)
            .and_then(|position| record.get(*position))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn require<'a>(&self, record: &'a StringRecord, column: Column) -> StatementsResult<&'a str> {
        self.get(record, column)
            .ok_or_else(|| StatementsError::Invalid(format!("{} missing", column.label())))
    }
}

pub trait StatementParser {
    fn parse(&self, input: &str) -> StatementsResult<Vec<StatementEntry>>;
}

#[derive(Clone, Default)]
pub struct CsvStatementParser {
    profile: CsvStatementProfile,
}

impl CsvStatementParser {
    #[must_use]
    pub fn new(profile: CsvStatementProfile) -> Self {
        Self { profile }
    }

    fn build_entry(
        &self,
        record: &StringRecord,
        columns: &ColumnMap,
    ) -> StatementsResult<StatementEntry> {
        let booked_raw = columns.require(record, Column::BookedAt)?;
        let booked_at = NaiveDateTime::parse_from_str(booked_raw, &self.profile.timestamp_format)
            .map_err(|err| {
                StatementsError::Parse(format!("invalid timestamp {booked_raw}: {err}"))
            })?
            .and_utc();

        let amount_raw = columns.require(record, Column::Amount)?.replace(',', "");
        let amount: Amount = amount_raw
            .parse()
            .map_err(|err| StatementsError::Parse(format!("invalid amount {amount_raw}: {err}")))?;

        let currency_raw = columns.require(record, Column::Currency)?.to_uppercase();
        let currency: Currency = currency_raw
            .parse()
            .map_err(|err| StatementsError::Invalid(format!("{err}")))?;

        let mut entry = StatementEntry {
            id: columns.require(record, Column::EntryId)?.to_owned(),
            bank_account: columns.require(record, Column::BankAccount)?.to_owned(),
            booked_at,
            amount,
            currency,
            description: columns
                .get(record, Column::Description)
                .unwrap_or_default()
                .to_owned(),
            entry_reference: columns.get(record, Column::Reference).map(str::to_owned),
            checksum: String::new(),
            state: StatementEntryState::New,
        };
        entry.checksum = entry.compute_checksum();
        Ok(entry)
    }
}

impl StatementParser for CsvStatementParser {
    fn parse(&self, input: &str) -> StatementsResult<Vec<StatementEntry>> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(input.as_bytes());
        let columns = ColumnMap::resolve(
            &self.profile,
            reader
                .headers()
                .map_err(|err| StatementsError::Csv(err.to_string()))?,
        )?;
        let mut entries = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|err| StatementsError::Csv(err.to_string()))?;
            // Feeds pad exports with blank separator rows.
            if record.iter().any(|field| !field.trim().is_empty()) {
                entries.push(self.build_entry(&record, &columns)?);
            }
        }
        Ok(entries)
    }
}
