use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::net::TcpStream;

/// A bounded FIFO of idle sockets.
///
/// Sockets come back only after a fully successful request; anything
/// that failed mid-request is dropped by the caller instead, so a
/// borrowed socket is always positioned between frames.
pub(crate) struct ConnectionPool {
    idle: Mutex<VecDeque<TcpStream>>,
    capacity: usize,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn take(&self) -> Option<TcpStream> {
        self.idle.lock().pop_front()
    }

    /// Return a socket, closing it when the pool is full.
    pub fn give_back(&self, stream: TcpStream) {
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push_back(stream);
        }
    }

    /// Drop every pooled socket.
    pub fn drain(&self) {
        self.idle.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.idle.lock().len()
    }
}
