//! Scripted bus for unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::codec::{Request, Response};
use crate::error::TransportError;
use crate::transport::Bus;

type Handler =
    dyn Fn(&Request, &mut HashMap<u16, u16>) -> Result<Response, TransportError> + Send + Sync;

/// A [`Bus`] that records every transaction and answers from a handler.
pub(crate) struct MockBus {
    handler: Box<Handler>,
    memory: Mutex<HashMap<u16, u16>>,
    log: Mutex<Vec<Request>>,
}

impl MockBus {
    /// Answer every request with `handler`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Request) -> Result<Response, TransportError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(move |request: &Request, _: &mut HashMap<u16, u16>| {
                handler(*request)
            }),
            memory: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// A device backed by register memory; unset registers read as zero.
    pub fn memory(initial: &[(u16, u16)]) -> Self {
        Self::memory_with_fault(initial, |_| None)
    }

    /// Like [`memory`](Self::memory), but `fault` may fail a request
    /// before it touches memory.
    pub fn memory_with_fault<F>(initial: &[(u16, u16)], fault: F) -> Self
    where
        F: Fn(&Request) -> Option<TransportError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(move |request: &Request, memory: &mut HashMap<u16, u16>| {
                if let Some(err) = fault(request) {
                    return Err(err);
                }
                match *request {
                    Request::ReadHoldingRegisters { address, count } => {
                        Ok(Response::ReadHoldingRegisters(
                            (address..address + count)
                                .map(|a| memory.get(&a).copied().unwrap_or(0))
                                .collect(),
                        ))
                    }
                    Request::WriteSingleRegister { address, value } => {
                        memory.insert(address, value);
                        Ok(Response::WriteSingleRegister { address, value })
                    }
                }
            }),
            memory: Mutex::new(initial.iter().copied().collect()),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }

    pub fn reads(&self) -> usize {
        self.requests().iter().filter(|r| !r.is_write()).count()
    }

    pub fn writes(&self) -> usize {
        self.requests().iter().filter(|r| r.is_write()).count()
    }

    /// Current content of a memory register.
    pub fn register(&self, address: u16) -> Option<u16> {
        self.memory.lock().unwrap().get(&address).copied()
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn execute(&self, request: Request) -> Result<Response, TransportError> {
        self.log.lock().unwrap().push(request);
        let mut memory = self.memory.lock().unwrap();
        (self.handler)(&request, &mut memory)
    }
}
