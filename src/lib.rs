//! Client library for inverters behind Solarman V5 data logging sticks.
//!
//! The sticks tunnel plain Modbus RTU inside a vendor framing protocol over
//! TCP, port 8899. [`v5`] implements that framing as a [`tokio_util`] codec,
//! [`connection`] the request-response session on top of it, [`schema`] and
//! [`parser`] turn raw register words into named values according to a
//! register map, and [`inverter`] drives whole poll cycles.

pub mod checksum;
pub mod commands;
pub mod connection;
pub mod inverter;
pub mod parser;
pub mod schema;
pub mod v5;
