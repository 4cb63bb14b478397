//! Transport session to a data logging stick.
//!
//! V5 sticks serve a single client and answer strictly one request at a
//! time, so the session is a plain request-response loop over a
//! [`Framed`] TCP stream rather than a pipelined worker. `&mut self` on
//! [`Connection::send`] is what serializes the traffic.

use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::v5::{Operation, Request, Response, SequenceNumber, V5Codec};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("connecting to `{0}` did not complete within {1:?}")]
    ConnectTimeout(String, Duration),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("no valid response within {0:?}")]
    ResponseTimeout(Duration),
    #[error("the logging stick closed the connection")]
    ConnectionClosed,
    #[error("the response kind did not match the request")]
    UnexpectedResponse,
    #[error("could not shut down the connection")]
    Shutdown(#[source] std::io::Error),
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Host name or IP address of the data logging stick.
    #[arg(long)]
    host: String,

    /// TCP port the stick listens on.
    #[arg(long, default_value = "8899")]
    port: u16,

    /// Serial number of the data logging stick (not of the inverter behind
    /// it). Printed on the stick's label and echoed in every frame.
    #[arg(long, short = 's')]
    logger_serial: u32,

    /// The modbus device ID of the inverter behind the stick.
    #[arg(long, short = 'i', default_value = "1")]
    device_id: u8,

    /// If no valid response is received in this amount of time, consider the
    /// request failed and the session desynchronized.
    #[arg(long, default_value = "10s")]
    read_timeout: humantime::Duration,

    /// Transparently reopen the TCP connection when a call finds it dropped.
    #[arg(long)]
    auto_reconnect: bool,
}

impl Args {
    pub fn config(&self) -> Config {
        Config {
            host: self.host.clone(),
            port: self.port,
            logger_serial: self.logger_serial,
            device_id: self.device_id,
            read_timeout: *self.read_timeout,
            auto_reconnect: self.auto_reconnect,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub logger_serial: u32,
    pub device_id: u8,
    pub read_timeout: Duration,
    pub auto_reconnect: bool,
}

impl Config {
    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

type Io = Framed<TcpStream, V5Codec>;

pub struct Connection {
    config: Config,
    io: Option<Io>,
    sequence: SequenceNumber,
}

impl Connection {
    pub async fn connect(config: Config) -> Result<Connection, Error> {
        let io = open(&config).await?;
        Ok(Self { config, io: Some(io), sequence: SequenceNumber::default() })
    }

    pub fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    /// Sends one operation and waits for its correlated response.
    ///
    /// A fresh sequence number is drawn for every call; frames that fail any
    /// validation are skipped by the codec, so only the matching response (or
    /// the deadline) ends the wait. Timeouts and stream errors drop the
    /// session, since a stick that answered late or garbled can no longer be
    /// trusted to stay aligned with our sequence numbers.
    pub async fn send(&mut self, operation: Operation) -> Result<Response, Error> {
        if self.io.is_none() {
            if !self.config.auto_reconnect {
                return Err(Error::ConnectionClosed);
            }
            debug!("reconnecting for this request");
            self.io = Some(open(&self.config).await?);
        }
        let Some(io) = &mut self.io else {
            return Err(Error::ConnectionClosed);
        };
        let request = Request {
            slave_id: self.config.device_id,
            sequence: self.sequence.next(),
            operation,
        };
        trace!(message = "sending request", sequence = request.sequence);
        let sent = io.send(&request).await;
        if let Err(error) = sent {
            self.io = None;
            return Err(Error::Send(error));
        }
        let deadline = Instant::now() + self.config.read_timeout;
        let received = tokio::time::timeout_at(deadline, io.next()).await;
        match received {
            Err(_elapsed) => {
                warn!(message = "request timed out", sequence = request.sequence);
                self.io = None;
                Err(Error::ResponseTimeout(self.config.read_timeout))
            }
            Ok(None) => {
                self.io = None;
                Err(Error::ConnectionClosed)
            }
            Ok(Some(Err(error))) => {
                self.io = None;
                Err(Error::Receive(error))
            }
            Ok(Some(Ok(response))) => Ok(response),
        }
    }

    /// Closes the session. Safe to call repeatedly or when already closed.
    pub async fn disconnect(&mut self) -> Result<(), Error> {
        if let Some(mut io) = self.io.take() {
            io.close().await.map_err(Error::Shutdown)?;
            debug!("disconnected");
        }
        Ok(())
    }
}

async fn open(config: &Config) -> Result<Io, Error> {
    let address = config.address();
    info!(message = "connecting...", address);
    let connected = tokio::time::timeout(config.read_timeout, async {
        let addresses = tokio::net::lookup_host(&address)
            .await
            .map_err(|e| Error::LookupHost(e, address.clone()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        TcpStream::connect(&*addresses).await.map_err(|e| Error::Connect(e, address.clone()))
    })
    .await;
    let socket = match connected {
        Ok(result) => result?,
        Err(_elapsed) => return Err(Error::ConnectTimeout(address, config.read_timeout)),
    };
    let nodelay_result = socket.set_nodelay(true);
    trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
    info!(message = "connected");
    Ok(Framed::new(socket, V5Codec::new(config.logger_serial)))
}

/// An in-process logging stick for the test suites here and in the inverter
/// client.
#[cfg(test)]
pub(crate) mod testing {
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    use super::Config;
    use crate::v5::testing::{echo_response, registers_response};

    pub(crate) const SERIAL: u32 = 2712345678;

    /// What the fake stick should do with one parsed request.
    pub(crate) enum Reply {
        /// Answer a read with these register words.
        Words(Vec<u16>),
        /// Acknowledge a write by echoing it.
        Ack,
        /// Drop the TCP connection without answering.
        Drop,
        /// Stay silent but keep the connection open.
        Silence,
    }

    /// Spawns a fake stick accepting connections until the test ends.
    ///
    /// `respond` sees `(function code, address, count-or-value)` for each
    /// request and decides the reply.
    pub(crate) async fn spawn_stick<F>(respond: F) -> SocketAddr
    where
        F: Fn(u8, u16, u16) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                loop {
                    let mut buffer = [0u8; 512];
                    let Ok(n) = socket.read(&mut buffer).await else { break };
                    if n == 0 {
                        break;
                    }
                    // Request business field starts at offset 26:
                    // slave, fc, address BE, count-or-value BE.
                    let request = &buffer[..n];
                    let sequence = request[5];
                    let function_code = request[27];
                    let address = u16::from_be_bytes([request[28], request[29]]);
                    let argument = u16::from_be_bytes([request[30], request[31]]);
                    let frame = match respond(function_code, address, argument) {
                        Reply::Words(words) => {
                            registers_response(sequence, SERIAL, function_code, &words)
                        }
                        Reply::Ack => {
                            echo_response(sequence, SERIAL, function_code, address, argument)
                        }
                        Reply::Drop => break,
                        Reply::Silence => continue,
                    };
                    if socket.write_all(&frame).await.is_err() {
                        break;
                    }
                }
            }
        });
        address
    }

    pub(crate) fn config_for(address: SocketAddr) -> Config {
        Config {
            host: address.ip().to_string(),
            port: address.port(),
            logger_serial: SERIAL,
            device_id: 1,
            read_timeout: Duration::from_millis(500),
            auto_reconnect: false,
        }
    }
}
