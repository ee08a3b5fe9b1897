//! VISA resource string parsing.
//!
//! Only the shape of the string is inspected: enough to decide whether the
//! resource can be reached over a plain TCP socket or needs a VISA library.
//!
//! Supported forms:
//! - `TCPIP[board]::host::port::SOCKET` (raw SCPI socket, port 5025 on Keysight SMUs)
//! - `TCPIP[board]::host[::device]::INSTR` (VXI-11 / HiSLIP, via VISA)
//! - `USB[board]::vendor::product::serial[::interface]::INSTR`
//! - `GPIB[board]::address[::secondary]::INSTR`

use crate::error::{SmuError, SmuResult};
use std::fmt;
use std::str::FromStr;

/// Raw SCPI socket port of Keysight LXI instruments.
pub const DEFAULT_SOCKET_PORT: u16 = 5025;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAddress {
    TcpSocket {
        board: u16,
        host: String,
        port: u16,
    },
    TcpInstr {
        board: u16,
        host: String,
        device: Option<String>,
    },
    Usb {
        board: u16,
        vendor: u16,
        product: u16,
        serial: String,
    },
    Gpib {
        board: u16,
        address: u8,
    },
}

impl ResourceAddress {
    /// Whether the resource can be opened without a VISA library.
    pub fn is_raw_socket(&self) -> bool {
        matches!(self, ResourceAddress::TcpSocket { .. })
    }
}

fn invalid(resource: &str, reason: &str) -> SmuError {
    SmuError::Configuration(format!("invalid VISA resource '{resource}': {reason}"))
}

/// Split `TCPIP0` into (`TCPIP`, 0). A missing board number means board 0.
fn split_board(head: &str, prefix: &str) -> Option<u16> {
    let rest = head.get(prefix.len()..)?;
    if rest.is_empty() {
        Some(0)
    } else {
        rest.parse().ok()
    }
}

/// USB ids are written either in decimal (`2391`) or hex (`0x0957`).
fn parse_usb_id(field: &str) -> Option<u16> {
    let field = field.trim();
    match field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => field.parse().ok(),
    }
}

impl FromStr for ResourceAddress {
    type Err = SmuError;

    fn from_str(s: &str) -> SmuResult<Self> {
        let resource = s.trim();
        let parts: Vec<&str> = resource.split("::").collect();
        let head = parts[0].to_uppercase();
        let class = parts
            .last()
            .map(|p| p.to_uppercase())
            .unwrap_or_default();

        if head.starts_with("TCPIP") {
            let board =
                split_board(&head, "TCPIP").ok_or_else(|| invalid(resource, "bad board"))?;
            let host = parts
                .get(1)
                .filter(|h| !h.is_empty())
                .ok_or_else(|| invalid(resource, "missing host"))?
                .to_string();
            match (class.as_str(), parts.len()) {
                ("SOCKET", 4) => {
                    let port = parts[2]
                        .parse()
                        .map_err(|_| invalid(resource, "bad port"))?;
                    Ok(ResourceAddress::TcpSocket { board, host, port })
                }
                ("INSTR", 3) => Ok(ResourceAddress::TcpInstr {
                    board,
                    host,
                    device: None,
                }),
                ("INSTR", 4) => Ok(ResourceAddress::TcpInstr {
                    board,
                    host,
                    device: Some(parts[2].to_string()),
                }),
                _ => Err(invalid(resource, "expected ::SOCKET or ::INSTR")),
            }
        } else if head.starts_with("USB") {
            let board = split_board(&head, "USB").ok_or_else(|| invalid(resource, "bad board"))?;
            if class != "INSTR" || !(5..=6).contains(&parts.len()) {
                return Err(invalid(resource, "expected USB::vid::pid::serial::INSTR"));
            }
            let vendor = parse_usb_id(parts[1]).ok_or_else(|| invalid(resource, "bad vendor id"))?;
            let product =
                parse_usb_id(parts[2]).ok_or_else(|| invalid(resource, "bad product id"))?;
            Ok(ResourceAddress::Usb {
                board,
                vendor,
                product,
                serial: parts[3].to_string(),
            })
        } else if head.starts_with("GPIB") {
            let board =
                split_board(&head, "GPIB").ok_or_else(|| invalid(resource, "bad board"))?;
            if class != "INSTR" || !(3..=4).contains(&parts.len()) {
                return Err(invalid(resource, "expected GPIB::address::INSTR"));
            }
            let address = parts[1]
                .parse()
                .map_err(|_| invalid(resource, "bad primary address"))?;
            Ok(ResourceAddress::Gpib { board, address })
        } else {
            Err(invalid(resource, "unsupported interface type"))
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAddress::TcpSocket { board, host, port } => {
                write!(f, "TCPIP{board}::{host}::{port}::SOCKET")
            }
            ResourceAddress::TcpInstr {
                board,
                host,
                device: Some(device),
            } => write!(f, "TCPIP{board}::{host}::{device}::INSTR"),
            ResourceAddress::TcpInstr { board, host, .. } => {
                write!(f, "TCPIP{board}::{host}::INSTR")
            }
            ResourceAddress::Usb {
                board,
                vendor,
                product,
                serial,
            } => write!(f, "USB{board}::{vendor}::{product}::{serial}::0::INSTR"),
            ResourceAddress::Gpib { board, address } => write!(f, "GPIB{board}::{address}::INSTR"),
        }
    }
}
