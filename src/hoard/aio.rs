//! Asynchronous I/O Hoarder
//!
//! Queued requests keep the user buffer capability and the completion
//! cookie until the request finishes.

use alloc::vec::Vec;

use spin::Mutex;

use super::proc::Process;
use crate::arch::ctemp::CapTemp;
use crate::cap::Capability;
use crate::revoke::cookie::Cookie;
use crate::revoke::error::Result;

/// One queued request.
#[derive(Debug, Clone, Copy)]
pub struct AioRequest {
    /// Request identifier.
    pub id: u64,
    /// User buffer.
    pub buf: Capability,
    /// Value delivered with the completion notification.
    pub sigev_value: Capability,
}

/// A process's queued requests.
#[derive(Debug, Default)]
pub struct AioQueue {
    requests: Mutex<Vec<AioRequest>>,
}

impl AioQueue {
    /// An empty queue.
    pub const fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a request.
    pub fn submit(&self, req: AioRequest) {
        self.requests.lock().push(req);
    }

    /// Complete and remove a request.
    pub fn complete(&self, id: u64) -> Option<AioRequest> {
        let mut requests = self.requests.lock();
        let pos = requests.iter().position(|r| r.id == id)?;
        Some(requests.swap_remove(pos))
    }

    /// Look up a queued request.
    pub fn get(&self, id: u64) -> Option<AioRequest> {
        self.requests.lock().iter().find(|r| r.id == id).copied()
    }

    pub(crate) fn clear(&self) {
        self.requests.lock().clear();
    }
}

/// Revoke the capabilities held by a process's queued requests.
pub fn revoke(proc: &Process, cookie: &Cookie<'_>) -> Result<u64> {
    let mut temp = CapTemp::new();
    let mut revoked = 0;
    for req in proc.aio.requests.lock().iter_mut() {
        revoked += cookie.revoke_cap(&mut temp, &mut req.buf) as u64;
        revoked += cookie.revoke_cap(&mut temp, &mut req.sigev_value) as u64;
    }
    Ok(revoked)
}
