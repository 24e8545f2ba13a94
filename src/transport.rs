//! Byte transports for device communication.
//!
//! Defines the `Transport` trait and concrete implementations for serial
//! (COM/RS-232) and network (TCP) connections, plus a dry-run variant that
//! logs instead of touching hardware. Both protocol engines sit on top of
//! this uniform byte pipe.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::applog::log_info;
use crate::error::{GatewayError, Result, TransportError};
use crate::models::Printer;

/// Abstract byte-level transport.
///
/// `read` returns an empty buffer on timeout rather than failing; hard I/O
/// errors bubble up unchanged.
pub trait Transport: Send {
    /// Establish the connection. Opening an open transport is a no-op.
    fn open(&mut self) -> Result<()>;

    /// Tear down the connection. Always safe to call.
    fn close(&mut self);

    /// Write all bytes.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read up to `max` bytes, waiting at most `timeout`.
    fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Human-readable description of the connection target.
    fn description(&self) -> String;
}

// ---------------------------------------------------------------------------
// Serial transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: String,
    pub baudrate: u32,
    pub data_bits: u8,
    pub parity: String,
    pub stop_bits: f64,
    pub timeout_ms: u64,
}

pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self { config, port: None }
    }

    fn data_bits(bits: u8) -> serialport::DataBits {
        match bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        }
    }

    fn parity(value: &str) -> serialport::Parity {
        match value.to_uppercase().as_str() {
            "E" => serialport::Parity::Even,
            "O" => serialport::Parity::Odd,
            // serialport has no mark/space parity
            "M" => serialport::Parity::Odd,
            "S" => serialport::Parity::Even,
            _ => serialport::Parity::None,
        }
    }

    fn stop_bits(value: f64) -> serialport::StopBits {
        if value >= 1.5 {
            serialport::StopBits::Two
        } else {
            serialport::StopBits::One
        }
    }

    fn classify_open_error(&self, err: serialport::Error) -> TransportError {
        let port = self.config.port.clone();
        match err.kind {
            serialport::ErrorKind::NoDevice => TransportError::PortMissing { port },
            serialport::ErrorKind::Io(ErrorKind::NotFound) => TransportError::PortMissing { port },
            serialport::ErrorKind::Io(ErrorKind::PermissionDenied) => {
                TransportError::PortBusy { port }
            }
            _ => {
                let text = err.to_string().to_lowercase();
                if text.contains("busy") || text.contains("denied") || text.contains("in use") {
                    TransportError::PortBusy { port }
                } else {
                    TransportError::Io(std::io::Error::other(err.to_string()))
                }
            }
        }
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        debug!(
            "Opening serial port {} @ {} baud",
            self.config.port, self.config.baudrate
        );
        let port = serialport::new(&self.config.port, self.config.baudrate)
            .data_bits(Self::data_bits(self.config.data_bits))
            .parity(Self::parity(&self.config.parity))
            .stop_bits(Self::stop_bits(self.config.stop_bits))
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .open()
            .map_err(|e| self.classify_open_error(e))?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.open()?;
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| TransportError::Config("serial port not open".into()))?;
        debug!("Serial TX ({} bytes): {:02X?}", data.len(), data);
        port.write_all(data)
            .map_err(TransportError::from)?;
        port.flush().map_err(TransportError::from)?;
        Ok(())
    }

    fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.open()?;
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| TransportError::Config("serial port not open".into()))?;
        port.set_timeout(timeout)
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;
        let mut buf = vec![0u8; max.max(1)];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(ref e) if e.kind() == ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(TransportError::Io(e).into()),
        }
    }

    fn description(&self) -> String {
        format!("Serial({}@{})", self.config.port, self.config.baudrate)
    }
}

// ---------------------------------------------------------------------------
// TCP transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub ip_address: String,
    pub tcp_port: u16,
    pub timeout_ms: u64,
}

pub struct TcpTransport {
    config: TcpConfig,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.config.ip_address, self.config.tcp_port)
    }
}

impl Transport for TcpTransport {
    fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = self.addr();
        debug!("Connecting TCP to {addr}");
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let resolved = addr
            .to_socket_addrs()
            .map_err(|e| TransportError::NetUnreachable {
                addr: addr.clone(),
                source: e,
            })?
            .next()
            .ok_or_else(|| TransportError::Config(format!("cannot resolve {addr}")))?;
        let stream = TcpStream::connect_timeout(&resolved, timeout).map_err(|e| {
            TransportError::NetUnreachable {
                addr: addr.clone(),
                source: e,
            }
        })?;
        let _ = stream.set_nodelay(true);
        let _ = stream.set_write_timeout(Some(timeout));
        let _ = stream.set_read_timeout(Some(timeout));
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.open()?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::Config("TCP not connected".into()))?;
        debug!("TCP TX ({} bytes): {:02X?}", data.len(), data);
        stream.write_all(data).map_err(TransportError::from)?;
        stream.flush().map_err(TransportError::from)?;
        Ok(())
    }

    fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.open()?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::Config("TCP not connected".into()))?;
        // A zero read timeout means "block forever" to the OS; clamp up.
        stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .map_err(TransportError::from)?;
        let mut buf = vec![0u8; max.max(1)];
        match stream.read(&mut buf) {
            Ok(0) => Err(TransportError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ))
            .into()),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(ref e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(Vec::new())
            }
            Err(e) => Err(TransportError::Io(e).into()),
        }
    }

    fn description(&self) -> String {
        format!("TCP({})", self.addr())
    }
}

// ---------------------------------------------------------------------------
// Dry-run transport
// ---------------------------------------------------------------------------

/// Substitutes writes with structured log entries and returns empty reads;
/// used for offline validation without touching hardware.
pub struct DryRunTransport {
    target: String,
}

impl DryRunTransport {
    pub fn new(target: String) -> Self {
        Self { target }
    }
}

impl Transport for DryRunTransport {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn write(&mut self, data: &[u8]) -> Result<()> {
        log_info(
            "DRY_RUN_WRITE",
            json!({
                "target": self.target,
                "bytes_hex": hex_string(data),
                "length": data.len(),
            }),
        );
        Ok(())
    }

    fn read(&mut self, _max: usize, timeout: Duration) -> Result<Vec<u8>> {
        // Emulate a read timeout so protocol loops terminate naturally.
        std::thread::sleep(timeout.min(Duration::from_millis(50)));
        Ok(Vec::new())
    }

    fn description(&self) -> String {
        format!("DryRun({})", self.target)
    }
}

pub fn hex_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the transport a printer record describes.
pub fn create_transport(printer: &Printer, dry_run: bool) -> Result<Box<dyn Transport>> {
    let kind = printer.transport.to_lowercase();
    match kind.as_str() {
        "serial" => {
            let port = printer
                .port
                .clone()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    GatewayError::Transport(TransportError::Config(
                        "serial transport requires a COM port".into(),
                    ))
                })?;
            let config = SerialConfig {
                port,
                baudrate: printer.baudrate,
                data_bits: printer.data_bits,
                parity: printer.parity.clone(),
                stop_bits: printer.stop_bits,
                timeout_ms: printer.timeout_ms,
            };
            if dry_run {
                Ok(Box::new(DryRunTransport::new(format!(
                    "Serial({}@{})",
                    config.port, config.baudrate
                ))))
            } else {
                Ok(Box::new(SerialTransport::new(config)))
            }
        }
        "lan" => {
            let ip_address = printer
                .ip_address
                .clone()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    GatewayError::Transport(TransportError::Config(
                        "LAN transport requires an IP address".into(),
                    ))
                })?;
            let config = TcpConfig {
                ip_address,
                tcp_port: printer.tcp_port,
                timeout_ms: printer.timeout_ms,
            };
            if dry_run {
                Ok(Box::new(DryRunTransport::new(format!(
                    "TCP({}:{})",
                    config.ip_address, config.tcp_port
                ))))
            } else {
                Ok(Box::new(TcpTransport::new(config)))
            }
        }
        other => Err(GatewayError::Transport(TransportError::Config(format!(
            "unsupported transport type: {other}"
        )))),
    }
}

/// Enumerate serial ports for the REST tools endpoint.
pub fn list_serial_ports() -> Vec<serde_json::Value> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| {
                let description = match &p.port_type {
                    serialport::SerialPortType::UsbPort(usb) => {
                        usb.product.clone().unwrap_or_else(|| "USB serial".into())
                    }
                    serialport::SerialPortType::BluetoothPort => "Bluetooth serial".into(),
                    serialport::SerialPortType::PciPort => "PCI serial".into(),
                    serialport::SerialPortType::Unknown => "Serial port".into(),
                };
                json!({"device": p.port_name, "description": description})
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn printer(transport: &str) -> Printer {
        serde_json::from_value(json!({
            "id": 1,
            "name": "Test",
            "model": "datecs_fp700mx",
            "transport": transport,
            "port": "COM7",
            "baudrate": 115200,
            "data_bits": 8,
            "parity": "N",
            "stop_bits": 1.0,
            "timeout_ms": 250,
            "ip_address": "192.0.2.1",
            "tcp_port": 4999,
            "enabled": true,
            "dry_run": false,
            "config": {},
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn test_factory_serial_description() {
        let t = create_transport(&printer("serial"), false).unwrap();
        assert_eq!(t.description(), "Serial(COM7@115200)");
    }

    #[test]
    fn test_factory_lan_description() {
        let t = create_transport(&printer("lan"), false).unwrap();
        assert_eq!(t.description(), "TCP(192.0.2.1:4999)");
    }

    #[test]
    fn test_factory_rejects_unknown_kind() {
        assert!(create_transport(&printer("bluetooth"), false).is_err());
    }

    #[test]
    fn test_factory_requires_serial_port() {
        let mut p = printer("serial");
        p.port = None;
        assert!(create_transport(&p, false).is_err());
    }

    #[test]
    fn test_dry_run_reads_empty() {
        let mut t = create_transport(&printer("serial"), true).unwrap();
        t.open().unwrap();
        t.write(&[0x01, 0x02]).unwrap();
        let read = t.read(16, Duration::from_millis(10)).unwrap();
        assert!(read.is_empty());
    }

    #[test]
    fn test_serial_parity_mapping() {
        assert_eq!(SerialTransport::parity("N"), serialport::Parity::None);
        assert_eq!(SerialTransport::parity("e"), serialport::Parity::Even);
        assert_eq!(SerialTransport::parity("O"), serialport::Parity::Odd);
    }

    #[test]
    fn test_hex_string() {
        assert_eq!(hex_string(&[0x01, 0xAB]), "01ab");
    }
}
