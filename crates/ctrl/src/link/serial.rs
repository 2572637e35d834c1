// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Production [`BusLink`] over a tokio-serial port.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{
    ClearBuffer, DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits,
};
use tracing::{debug, info, warn};

use crate::link::{BusLink, LinkError, LinkFuture, LinkInfo, LinkSettings};
use crate::proto::{latin1, ETX};

/// Settle pause between close and open during a reopen cycle.
const REOPEN_PAUSE: Duration = Duration::from_millis(500);

pub struct SerialLink {
    settings: LinkSettings,
    port: Option<SerialStream>,
}

impl SerialLink {
    pub fn new(settings: LinkSettings) -> Self {
        Self { settings, port: None }
    }

    fn data_bits(&self) -> DataBits {
        match self.settings.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    fn parity(&self) -> Parity {
        match self.settings.parity.to_ascii_uppercase() {
            'E' => Parity::Even,
            'O' => Parity::Odd,
            _ => Parity::None,
        }
    }

    fn stop_bits(&self) -> StopBits {
        match self.settings.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        }
    }

    async fn open_port(&mut self) -> Result<(), LinkError> {
        self.port = None;

        let mut port = tokio_serial::new(&self.settings.port, self.settings.baud)
            .data_bits(self.data_bits())
            .parity(self.parity())
            .stop_bits(self.stop_bits())
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| LinkError::Io(e.to_string()))?;

        port.clear(ClearBuffer::All).map_err(|e| LinkError::Io(e.to_string()))?;
        if self.settings.manual_rts {
            // Receiver mode until the first transmission keys up.
            port.write_request_to_send(false).map_err(|e| LinkError::Io(e.to_string()))?;
        }

        info!(port = %self.settings.port, baud = self.settings.baud, "serial port opened");
        self.port = Some(port);
        Ok(())
    }

    async fn poll_port(
        &mut self,
        frame: Bytes,
        read_timeout: Duration,
        expect_response: bool,
    ) -> Result<Vec<u8>, LinkError> {
        let manual_rts = self.settings.manual_rts;
        let rts_enable = self.settings.rts_enable_delay;
        let rts_disable = self.settings.rts_disable_delay;
        let port = self.port.as_mut().ok_or(LinkError::Closed)?;

        port.clear(ClearBuffer::All).map_err(|e| LinkError::Io(e.to_string()))?;

        if manual_rts {
            port.write_request_to_send(true).map_err(|e| LinkError::Io(e.to_string()))?;
            tokio::time::sleep(rts_enable).await;
        }

        port.write_all(&frame).await.map_err(|e| LinkError::Io(e.to_string()))?;
        port.flush().await.map_err(|e| LinkError::Io(e.to_string()))?;

        if manual_rts {
            tokio::time::sleep(rts_disable).await;
            port.write_request_to_send(false).map_err(|e| LinkError::Io(e.to_string()))?;
            // Drop our own echo before listening.
            port.clear(ClearBuffer::Input).map_err(|e| LinkError::Io(e.to_string()))?;
        }

        debug!(tx = %latin1(&frame), "frame sent");

        if !expect_response {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + read_timeout;
        let mut reply = Vec::with_capacity(32);
        let mut pending_checksum = 2usize;
        let mut etx_seen = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LinkError::Timeout);
            }

            let mut byte = [0u8; 1];
            match tokio::time::timeout(remaining, port.read(&mut byte)).await {
                Err(_) => return Err(LinkError::Timeout),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Ok(Err(e)) => return Err(LinkError::Io(e.to_string())),
                Ok(Ok(0)) => continue,
                Ok(Ok(_)) => {}
            }

            reply.push(byte[0]);
            if etx_seen {
                pending_checksum -= 1;
                if pending_checksum == 0 {
                    debug!(rx = %latin1(&reply), "frame received");
                    return Ok(reply);
                }
            } else if byte[0] == ETX {
                etx_seen = true;
            }
        }
    }
}

impl BusLink for SerialLink {
    fn open(&mut self) -> LinkFuture<'_, ()> {
        Box::pin(self.open_port())
    }

    fn close(&mut self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            if self.port.take().is_some() {
                info!(port = %self.settings.port, "serial port closed");
            }
            Ok(())
        })
    }

    fn reopen(&mut self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            warn!(port = %self.settings.port, "reopening serial port");
            self.port = None;
            tokio::time::sleep(REOPEN_PAUSE).await;
            self.open_port().await
        })
    }

    fn poll(
        &mut self,
        frame: Bytes,
        read_timeout: Duration,
        expect_response: bool,
    ) -> LinkFuture<'_, Vec<u8>> {
        Box::pin(self.poll_port(frame, read_timeout, expect_response))
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn info(&self) -> LinkInfo {
        LinkInfo {
            port: self.settings.port.clone(),
            baud: self.settings.baud,
            open: self.port.is_some(),
        }
    }
}
