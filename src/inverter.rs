//! The inverter polling client.
//!
//! Drives whole poll cycles over a register-map schema: every range is
//! queried in order with a retry budget, the raw words flow through the
//! parameter parser, and only a fully successful cycle replaces the
//! published snapshot. A cycle that exhausts its retries aborts and clears
//! the snapshot, so consumers never see a half-fresh mix of values.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{self, Config as ConnectionConfig, Connection};
use crate::parser::{DatasetInvalidated, ParameterParser, Value};
use crate::schema::{FieldDefinition, FunctionCode, RegisterRange, Schema};
use crate::v5::{Operation, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("range {start:#06X}..={end:#06X} failed after {attempts} attempts")]
    RangeFailed {
        start: u16,
        end: u16,
        attempts: u32,
        #[source]
        source: connection::Error,
    },
    #[error("the decoded dataset was invalidated")]
    Invalidated(#[from] DatasetInvalidated),
    #[error("writing to the inverter failed")]
    Write(#[source] connection::Error),
}

pub struct Inverter {
    connection_config: ConnectionConfig,
    schema: Schema,
    /// Attempts per range within one cycle, including the first one.
    retries: u32,
    connection: Option<Connection>,
    state: ConnectionState,
    snapshot: Option<HashMap<String, Value>>,
    last_update: Option<jiff::Timestamp>,
    /// Last successful query per schema range, for interval gating.
    range_queried: Vec<Option<Instant>>,
}

impl Inverter {
    pub fn new(connection_config: ConnectionConfig, schema: Schema, retries: u32) -> Inverter {
        let range_queried = vec![None; schema.requests.len()];
        Self {
            connection_config,
            schema,
            retries: retries.max(1),
            connection: None,
            state: ConnectionState::Disconnected,
            snapshot: None,
            last_update: None,
            range_queried,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.schema.fields()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    /// The dataset published by the last successful poll cycle, if any.
    pub fn snapshot(&self) -> Option<&HashMap<String, Value>> {
        self.snapshot.as_ref()
    }

    pub fn last_update(&self) -> Option<jiff::Timestamp> {
        self.last_update
    }

    /// Runs one poll cycle over all schema ranges.
    ///
    /// Ranges whose `interval` has not elapsed since their last successful
    /// query are skipped. Each queried range gets up to the configured number
    /// of attempts, reconnecting between them; once a range exhausts its
    /// budget the cycle aborts, the snapshot is cleared and the client is
    /// reported disconnected. Only when every range succeeds (or is
    /// legitimately skipped) does the accumulated dataset replace the
    /// snapshot, in one piece.
    pub async fn poll_once(&mut self) -> Result<(), Error> {
        let schema = self.schema.clone();
        let mut parser = ParameterParser::new(&schema);
        let cycle_start = Instant::now();
        for (index, range) in schema.requests.iter().enumerate() {
            if let (Some(interval), Some(queried)) = (range.interval, self.range_queried[index]) {
                if cycle_start.duration_since(queried) < Duration::from_secs(interval.into()) {
                    debug!(
                        message = "interval has not elapsed, skipping range",
                        start = range.start,
                        end = range.end,
                    );
                    continue;
                }
            }
            let data = self.query_range_retrying(range).await?;
            if let Err(invalidated) = parser.parse(&data, range.start, range.count()) {
                warn!(
                    message = "dataset invalidated, dropping the snapshot",
                    field = invalidated.field.as_str(),
                    value = invalidated.value,
                );
                self.snapshot = None;
                return Err(Error::Invalidated(invalidated));
            }
            self.range_queried[index] = Some(Instant::now());
        }
        self.snapshot = Some(parser.into_result());
        self.state = ConnectionState::Connected;
        self.last_update = Some(jiff::Timestamp::now());
        info!(message = "poll cycle complete", elapsed = ?cycle_start.elapsed());
        Ok(())
    }

    /// Writes `value` into a single holding register.
    ///
    /// Writes are never retried. Any failure drops the connection and
    /// propagates, leaving the caller to decide whether repeating the write
    /// is safe.
    pub async fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), Error> {
        self.write(Operation::WriteHolding { address, value }).await
    }

    /// Writes `values` into consecutive holding registers starting at
    /// `address`. Same at-most-once semantics as a single-register write.
    pub async fn write_multiple_registers(
        &mut self,
        address: u16,
        values: Vec<u16>,
    ) -> Result<(), Error> {
        self.write(Operation::WriteHoldings { address, values }).await
    }

    async fn write(&mut self, operation: Operation) -> Result<(), Error> {
        let outcome = match self.ensure_connected().await {
            Ok(connection) => connection.send(operation).await,
            Err(error) => Err(error),
        };
        match outcome {
            Ok(_echo) => Ok(()),
            Err(error) => {
                self.drop_connection().await;
                self.state = ConnectionState::Disconnected;
                Err(Error::Write(error))
            }
        }
    }

    async fn query_range_retrying(&mut self, range: &RegisterRange) -> Result<Vec<u8>, Error> {
        let mut attempts_left = self.retries;
        loop {
            let error = match self.query_range(range).await {
                Ok(data) => return Ok(data),
                Err(error) => error,
            };
            self.drop_connection().await;
            attempts_left -= 1;
            if attempts_left == 0 {
                self.state = ConnectionState::Disconnected;
                self.snapshot = None;
                return Err(Error::RangeFailed {
                    start: range.start,
                    end: range.end,
                    attempts: self.retries,
                    source: error,
                });
            }
            warn!(
                message = "range query failed, retrying",
                start = range.start,
                end = range.end,
                attempts_left,
                error = &error as &dyn std::error::Error,
            );
        }
    }

    async fn query_range(&mut self, range: &RegisterRange) -> Result<Vec<u8>, connection::Error> {
        let operation = match range.function_code {
            FunctionCode::ReadHoldings => {
                Operation::ReadHoldings { address: range.start, count: range.count() }
            }
            FunctionCode::ReadInputs => {
                Operation::ReadInputs { address: range.start, count: range.count() }
            }
        };
        let connection = self.ensure_connected().await?;
        match connection.send(operation).await? {
            Response::Registers(data) => Ok(data),
            Response::WriteEcho { .. } => Err(connection::Error::UnexpectedResponse),
        }
    }

    async fn ensure_connected(&mut self) -> Result<&mut Connection, connection::Error> {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => Connection::connect(self.connection_config.clone()).await?,
        };
        Ok(self.connection.insert(connection))
    }

    async fn drop_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(error) = connection.disconnect().await {
                debug!(
                    message = "error while disconnecting",
                    error = &error as &dyn std::error::Error
                );
            }
        }
    }
}
