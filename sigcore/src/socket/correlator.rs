use crate::request::SocketRequest;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// An in-flight request. `responder` is whatever the driver uses to deliver
/// the outcome; the correlator only guarantees it is handed out once.
#[derive(Debug)]
pub struct PendingRequest<T> {
    pub id: u64,
    pub verb: String,
    pub path: String,
    pub body: Option<Vec<u8>>,
    pub created_at: Instant,
    pub timeout_at: Instant,
    pub responder: T,
}

/// Table of pending requests keyed by correlation id. Every removal path
/// (`resolve`, `take_expired`, `drain`) takes ownership of the entry, so an
/// entry can leave the table at most once.
#[derive(Debug)]
pub struct RequestCorrelator<T> {
    next_id: u64,
    pending: HashMap<u64, PendingRequest<T>>,
}

impl<T> Default for RequestCorrelator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestCorrelator<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn register(
        &mut self,
        request: &SocketRequest,
        now: Instant,
        timeout: Duration,
        responder: T,
    ) -> u64 {
        let id = self.allocate_id();
        self.pending.insert(
            id,
            PendingRequest {
                id,
                verb: request.verb.clone(),
                path: request.path.clone(),
                body: request.body.clone(),
                created_at: now,
                timeout_at: now + timeout,
                responder,
            },
        );
        id
    }

    /// Removes the entry matching an inbound response. `None` for unknown or
    /// already-resolved ids.
    pub fn resolve(&mut self, id: u64) -> Option<PendingRequest<T>> {
        self.pending.remove(&id)
    }

    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingRequest<T>> {
        let expired: Vec<u64> = self
            .pending
            .values()
            .filter(|p| p.timeout_at <= now)
            .map(|p| p.id)
            .collect();
        let mut out: Vec<_> = expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect();
        out.sort_by_key(|p| p.id);
        out
    }

    pub fn drain(&mut self) -> Vec<PendingRequest<T>> {
        let mut out: Vec<_> = self.pending.drain().map(|(_, p)| p).collect();
        out.sort_by_key(|p| p.id);
        out
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.timeout_at).min()
    }
}
