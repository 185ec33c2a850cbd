//! Worker pool for heavy asymmetric crypto.
//!
//! Responder-side handshakes are dispatched to a bounded pool of OS
//! threads so the event loop never blocks on a Diffie-Hellman. The main
//! task submits an immutable request with a token; workers push immutable
//! results onto a completion queue; completions arrive in any order and the
//! main task correlates by token. A completion whose circuit has since been
//! destroyed is simply discarded by the caller.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::debug;

use super::handshake::{self, KeySeed, ResponderKeys};
use veil_common::{Result, VeilError};

/// Token correlating a submission with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CryptoToken(pub u64);

/// A unit of work for the pool.
#[derive(Debug)]
pub struct CryptoRequest {
    pub token: CryptoToken,
    pub onionskin: Vec<u8>,
}

/// The outcome of one unit of work.
pub struct CryptoCompletion {
    pub token: CryptoToken,
    pub result: Result<(Vec<u8>, KeySeed)>,
}

impl std::fmt::Debug for CryptoCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoCompletion")
            .field("token", &self.token)
            .field("ok", &self.result.is_ok())
            .finish()
    }
}

/// Bounded pool of OS threads answering circuit-extension handshakes.
pub struct CryptoWorkerPool {
    submit_tx: Option<mpsc::SyncSender<CryptoRequest>>,
    done_rx: mpsc::Receiver<CryptoCompletion>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl CryptoWorkerPool {
    /// Spawn `n_workers` threads sharing the responder keys. `depth` bounds
    /// the number of queued, unstarted requests.
    pub fn new(n_workers: usize, depth: usize, keys: Arc<ResponderKeys>) -> Self {
        let (submit_tx, submit_rx) = mpsc::sync_channel::<CryptoRequest>(depth);
        let (done_tx, done_rx) = mpsc::channel::<CryptoCompletion>();
        let submit_rx = Arc::new(Mutex::new(submit_rx));

        let mut workers = Vec::with_capacity(n_workers);
        for _ in 0..n_workers {
            let rx = Arc::clone(&submit_rx);
            let tx = done_tx.clone();
            let keys = Arc::clone(&keys);
            workers.push(thread::spawn(move || loop {
                let request = {
                    let guard = rx.lock().expect("crypto queue lock poisoned");
                    guard.recv()
                };
                let request = match request {
                    Ok(r) => r,
                    // Sender dropped: pool is shutting down
                    Err(_) => break,
                };
                let result =
                    handshake::respond(&mut rand::thread_rng(), &keys, &request.onionskin);
                let completion = CryptoCompletion {
                    token: request.token,
                    result,
                };
                if tx.send(completion).is_err() {
                    break;
                }
            }));
        }

        Self {
            submit_tx: Some(submit_tx),
            done_rx,
            workers,
        }
    }

    /// Queue a request. Fails with a transient resource error when the pool
    /// is saturated rather than blocking the event loop.
    pub fn submit(&self, request: CryptoRequest) -> Result<()> {
        let tx = self
            .submit_tx
            .as_ref()
            .ok_or_else(|| VeilError::internal("crypto pool already shut down"))?;
        match tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::TrySendError::Full(r)) => {
                debug!(token = r.token.0, "crypto worker queue full");
                Err(VeilError::resource("crypto worker queue full"))
            }
            Err(mpsc::TrySendError::Disconnected(_)) => {
                Err(VeilError::internal("crypto workers gone"))
            }
        }
    }

    /// Drain one completion if any worker has finished.
    pub fn try_recv(&self) -> Option<CryptoCompletion> {
        self.done_rx.try_recv().ok()
    }

    /// Block for the next completion; test harnesses use this.
    pub fn recv_blocking(&self) -> Option<CryptoCompletion> {
        self.done_rx.recv().ok()
    }
}

impl Drop for CryptoWorkerPool {
    fn drop(&mut self) {
        // Closing the submit side wakes every worker out of recv()
        self.submit_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::handshake::{ClientHandshake, OnionKeypair};

    fn pool_with_keys() -> (CryptoWorkerPool, Arc<ResponderKeys>) {
        let mut rng = rand::thread_rng();
        let keys = Arc::new(ResponderKeys {
            identity_digest: [0x21; 32],
            onion: OnionKeypair::generate(&mut rng),
        });
        (CryptoWorkerPool::new(2, 8, Arc::clone(&keys)), keys)
    }

    #[test]
    fn test_pool_answers_handshake() {
        let (pool, keys) = pool_with_keys();
        let mut rng = rand::thread_rng();
        let (client, onionskin) =
            ClientHandshake::start(&mut rng, keys.identity_digest, keys.onion.public_bytes());

        pool.submit(CryptoRequest {
            token: CryptoToken(7),
            onionskin,
        })
        .unwrap();

        let completion = pool.recv_blocking().unwrap();
        assert_eq!(completion.token, CryptoToken(7));
        let (reply, server_seed) = completion.result.unwrap();
        let client_seed = client.complete(&reply).unwrap();
        assert_eq!(client_seed.as_bytes(), server_seed.as_bytes());
    }

    #[test]
    fn test_pool_reports_bad_onionskin() {
        let (pool, _keys) = pool_with_keys();
        pool.submit(CryptoRequest {
            token: CryptoToken(9),
            onionskin: vec![0; 10],
        })
        .unwrap();
        let completion = pool.recv_blocking().unwrap();
        assert_eq!(completion.token, CryptoToken(9));
        assert!(completion.result.is_err());
    }

    #[test]
    fn test_pool_completions_correlate_by_token() {
        let (pool, keys) = pool_with_keys();
        let mut rng = rand::thread_rng();
        let mut tokens = std::collections::HashSet::new();
        for t in 0..4u64 {
            let (_, onionskin) =
                ClientHandshake::start(&mut rng, keys.identity_digest, keys.onion.public_bytes());
            pool.submit(CryptoRequest {
                token: CryptoToken(t),
                onionskin,
            })
            .unwrap();
            tokens.insert(CryptoToken(t));
        }
        for _ in 0..4 {
            let completion = pool.recv_blocking().unwrap();
            assert!(tokens.remove(&completion.token));
        }
        assert!(tokens.is_empty());
    }
}
