// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Half-duplex RS-485 bus access.
//!
//! The bus is shared and half-duplex: exactly one transmitter at a time.
//! [`BusLink`] is the seam the scheduler drives; the production
//! implementation is [`serial::SerialLink`], tests use the fake in
//! `test_support`.  Exclusivity is structural — the scheduler owns the link
//! and every injected command is serialized through its queue, so no two
//! `poll` calls can overlap.

pub mod serial;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;

/// Boxed future returned by [`BusLink`] methods (object-safe trait).
pub type LinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LinkError>> + Send + 'a>>;

/// Serial line parameters for one RS-485 port.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub port: String,
    pub baud: u32,
    /// `N`, `E` or `O`.
    pub parity: char,
    pub data_bits: u8,
    pub stop_bits: u8,
    /// Delay after raising RTS before the first byte goes out.
    pub rts_enable_delay: Duration,
    /// Delay after the last byte before RTS drops.
    pub rts_disable_delay: Duration,
    /// Default read deadline when the caller does not supply one.
    pub reply_timeout: Duration,
    /// Toggle RTS per frame.  False for adapters with hardware direction
    /// control, which are configured once at open.
    pub manual_rts: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud: 9600,
            parity: 'N',
            data_bits: 8,
            stop_bits: 1,
            rts_enable_delay: Duration::from_millis(10),
            rts_disable_delay: Duration::from_millis(10),
            reply_timeout: Duration::from_millis(2000),
            manual_rts: true,
        }
    }
}

/// Why a bus transaction failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No ETX (or incomplete checksum) before the deadline.
    Timeout,
    /// The port is not open.
    Closed,
    /// Underlying I/O failure, with the driver's message.
    Io(String),
}

impl LinkError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Closed => "closed",
            Self::Io(_) => "io",
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(detail) => write!(f, "io: {detail}"),
            other => f.write_str(other.as_str()),
        }
    }
}

impl std::error::Error for LinkError {}

/// Diagnostic snapshot of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub port: String,
    pub baud: u32,
    pub open: bool,
}

/// One half-duplex RS-485 port.
///
/// Object-safe for use as `Box<dyn BusLink>`.
pub trait BusLink: Send {
    fn open(&mut self) -> LinkFuture<'_, ()>;

    fn close(&mut self) -> LinkFuture<'_, ()>;

    /// Close then open; bus-level recovery when consecutive errors cross the
    /// reopen threshold.
    fn reopen(&mut self) -> LinkFuture<'_, ()>;

    /// Transmit `frame` and, when `expect_response`, read a reply up to
    /// `read_timeout`: byte by byte until ETX, then two checksum bytes.
    ///
    /// The whole transmit-then-receive cycle is one atomic bus transaction.
    fn poll(
        &mut self,
        frame: Bytes,
        read_timeout: Duration,
        expect_response: bool,
    ) -> LinkFuture<'_, Vec<u8>>;

    fn is_open(&self) -> bool;

    fn info(&self) -> LinkInfo;
}

/// Conversion helper so concrete links and `Box<dyn BusLink>` both slot into
/// the supervisor without explicit boxing.
pub trait Boxed {
    fn boxed(self) -> Box<dyn BusLink>;
}

impl<T: BusLink + 'static> Boxed for T {
    fn boxed(self) -> Box<dyn BusLink> {
        Box::new(self)
    }
}

impl Boxed for Box<dyn BusLink> {
    fn boxed(self) -> Box<dyn BusLink> {
        self
    }
}
