//! A simulated Macon controller on the far end of an in-memory link.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use macon_modbus::codec::{
    self, ExceptionCode, READ_HOLDING_REGISTERS, Request, WRITE_SINGLE_REGISTER,
};
use macon_modbus::transport::{Transport, TransportSettings};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const SLAVE: u8 = 1;

/// Device state shared with the test.
#[derive(Clone, Default)]
pub struct Device {
    registers: Arc<Mutex<HashMap<u16, u16>>>,
    rejected: Arc<Mutex<HashSet<u16>>>,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl Device {
    pub fn set(&self, address: u16, value: u16) {
        self.registers.lock().unwrap().insert(address, value);
    }

    pub fn get(&self, address: u16) -> u16 {
        self.registers
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Answer writes to `address` with an illegal data value exception.
    pub fn reject_writes_to(&self, address: u16) {
        self.rejected.lock().unwrap().insert(address);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                Request::WriteSingleRegister { address, value } => Some((address, value)),
                _ => None,
            })
            .collect()
    }

    fn answer(&self, frame: &[u8]) -> Vec<u8> {
        let frame = match codec::decode(frame) {
            Ok(frame) => frame,
            // A real device stays silent on a corrupted request.
            Err(_) => return Vec::new(),
        };
        let address = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
        let operand = u16::from_be_bytes([frame.payload[2], frame.payload[3]]);

        match frame.function {
            READ_HOLDING_REGISTERS => {
                self.requests
                    .lock()
                    .unwrap()
                    .push(Request::ReadHoldingRegisters {
                        address,
                        count: operand,
                    });
                let words: Vec<u16> = (address..address + operand).map(|a| self.get(a)).collect();
                codec::encode_read_response(SLAVE, &words)
            }
            WRITE_SINGLE_REGISTER => {
                self.requests
                    .lock()
                    .unwrap()
                    .push(Request::WriteSingleRegister {
                        address,
                        value: operand,
                    });
                if self.rejected.lock().unwrap().contains(&address) {
                    return codec::encode_exception(
                        SLAVE,
                        WRITE_SINGLE_REGISTER,
                        ExceptionCode::IllegalDataValue,
                    );
                }
                self.set(address, operand);
                codec::encode(SLAVE, WRITE_SINGLE_REGISTER, &frame.payload)
            }
            function => codec::encode_exception(SLAVE, function, ExceptionCode::IllegalFunction),
        }
    }

    async fn serve(self, mut link: DuplexStream) {
        // Both supported requests are eight bytes long.
        let mut frame = [0u8; 8];
        while link.read_exact(&mut frame).await.is_ok() {
            let response = self.answer(&frame);
            if response.is_empty() {
                continue;
            }
            if link.write_all(&response).await.is_err() {
                break;
            }
        }
    }
}

pub fn settings() -> TransportSettings {
    TransportSettings {
        slave: SLAVE,
        response_timeout: Duration::from_millis(200),
        frame_gap: Duration::from_millis(1),
        retries: 2,
        retry_backoff: Duration::from_millis(1),
    }
}

/// Start a simulated device and a transport connected to it.
pub fn connect(initial: &[(u16, u16)]) -> (Transport<DuplexStream>, Device) {
    let (host, remote) = tokio::io::duplex(1024);
    let device = Device::default();
    for (address, value) in initial {
        device.set(*address, *value);
    }
    tokio::spawn(device.clone().serve(remote));
    (Transport::new(host, settings()), device)
}
