//! Client side: raw batch calls and the iteration-probing retry loop.
//!
//! Each source value is driven by a [`Probe`]. Iteration 0 asks for the
//! canonical masked candidate; on rejection the probe walks iterations
//! `1, 2, ...` carrying the iteration-0 candidate as the conflict value, so a
//! successful retry is memoized server-side and the next client resolving the
//! same collision can jump straight to the winning iteration.

use crate::auth::Authenticator;
use crate::config::DEFAULT_READ_TIMEOUT_MS;
use crate::model::{ClaimRequest, ClaimResponse};
use crate::protocol::{encode_batch_request, read_batch_response, MAX_BATCH_SIZE};
use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::{debug, warn};

/// A source value bound to its final target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub source: String,
    pub target: String,
    pub iteration: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no free target for {value:?} within {max_iterations} iterations")]
    Exhausted { value: String, max_iterations: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Init,
    Probing { iteration: u32, has_hint: bool },
    Claimed { iteration: u32 },
    GaveUp,
}

/// Retry state machine for one source value.
#[derive(Debug, Clone)]
pub struct Probe {
    source: String,
    base: String,
    state: ProbeState,
    max_iterations: u32,
    last_target: Option<String>,
}

impl Probe {
    /// `base` is the iteration-0 candidate for `source`.
    pub fn new(source: impl Into<String>, base: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            source: source.into(),
            base: base.into(),
            state: ProbeState::Init,
            max_iterations,
            last_target: None,
        }
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ProbeState::Claimed { .. } | ProbeState::GaveUp)
    }

    /// The request for the current state, or `None` once the probe is done.
    /// `mask(source, iteration)` produces the candidate for an iteration.
    pub fn next_request<F>(&mut self, mask: &F) -> Option<ClaimRequest>
    where
        F: Fn(&str, u32) -> String,
    {
        let request = match self.state {
            ProbeState::Init => ClaimRequest::initial(&self.source, &self.base),
            ProbeState::Probing { iteration, .. } => ClaimRequest::retry(
                &self.source,
                mask(self.source.as_str(), iteration),
                &self.base,
                iteration,
            ),
            ProbeState::Claimed { .. } | ProbeState::GaveUp => return None,
        };
        self.last_target = Some(request.target.clone());
        Some(request)
    }

    /// Advance on the server's answer to the last request.
    pub fn observe(&mut self, response: &ClaimResponse) {
        self.state = match (self.state, response) {
            (ProbeState::Init, ClaimResponse::Linked) => ProbeState::Claimed { iteration: 0 },
            // A hint of 0 names the candidate that was just rejected, so it is no hint.
            (ProbeState::Init, ClaimResponse::Rejected { hint: Some(hint) }) if *hint > 0 => {
                self.probe_at(*hint, true)
            }
            (ProbeState::Init, ClaimResponse::Rejected { .. }) => self.probe_at(1, false),
            (ProbeState::Probing { iteration, .. }, ClaimResponse::Linked) => {
                ProbeState::Claimed { iteration }
            }
            (
                ProbeState::Probing {
                    iteration,
                    has_hint,
                },
                ClaimResponse::Rejected { .. },
            ) => {
                if has_hint {
                    warn!(
                        source = %self.source,
                        iteration,
                        "stale iteration hint, resuming sequential probing"
                    );
                }
                match iteration.checked_add(1) {
                    Some(next) => self.probe_at(next, false),
                    None => ProbeState::GaveUp,
                }
            }
            (done, _) => done,
        };
    }

    fn probe_at(&self, iteration: u32, has_hint: bool) -> ProbeState {
        if iteration > self.max_iterations {
            ProbeState::GaveUp
        } else {
            ProbeState::Probing {
                iteration,
                has_hint,
            }
        }
    }

    pub fn into_result(self) -> Result<Resolved, ResolveError> {
        match (self.state, self.last_target) {
            (ProbeState::Claimed { iteration }, Some(target)) => Ok(Resolved {
                source: self.source,
                target,
                iteration,
            }),
            _ => Err(ResolveError::Exhausted {
                value: self.source,
                max_iterations: self.max_iterations,
            }),
        }
    }
}

/// An authenticated connection to a unimask server.
///
/// Any failed exchange leaves the connection out of sync with the server, so
/// the client closes it and refuses every later call.
pub struct Client {
    stream: TcpStream,
    io_timeout: Duration,
    broken: bool,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs, secret: &str) -> Result<Self> {
        let authenticator = Authenticator::new(secret)?;
        Self::connect_with(
            addr,
            &authenticator,
            Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        )
        .await
    }

    /// Connect and authenticate; every later read is bounded by `io_timeout`.
    pub async fn connect_with(
        addr: impl ToSocketAddrs,
        authenticator: &Authenticator,
        io_timeout: Duration,
    ) -> Result<Self> {
        let mut stream = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("connect timed out"))?
            .context("connect to unimask server")?;
        stream.set_nodelay(true)?;

        let accepted = timeout(io_timeout, authenticator.answer(&mut stream))
            .await
            .map_err(|_| anyhow!("handshake timed out"))?
            .context("handshake failed")?;
        if !accepted {
            return Err(anyhow!("server rejected the shared secret"));
        }
        debug!("authenticated with unimask server");
        Ok(Self {
            stream,
            io_timeout,
            broken: false,
        })
    }

    /// Send one batch and wait for its responses, in request order.
    pub async fn claim_batch(
        &mut self,
        repository: &str,
        requests: &[ClaimRequest],
    ) -> Result<Vec<ClaimResponse>> {
        if self.broken {
            return Err(anyhow!("connection unusable after an earlier failed batch"));
        }
        let frame = encode_batch_request(repository, requests)?;
        match self.exchange(&frame, requests.len()).await {
            Ok(responses) => Ok(responses),
            Err(err) => {
                self.broken = true;
                // A late reply must never be read as the answer to another batch.
                let _ = self.stream.shutdown().await;
                Err(err)
            }
        }
    }

    /// Whether an earlier failure has closed this connection.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    async fn exchange(&mut self, frame: &[u8], expected: usize) -> Result<Vec<ClaimResponse>> {
        timeout(self.io_timeout, async {
            self.stream.write_all(frame).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| anyhow!("timed out sending claim batch"))??;

        let responses = timeout(self.io_timeout, read_batch_response(&mut self.stream))
            .await
            .map_err(|_| anyhow!("timed out waiting for claim responses"))??;
        if responses.len() != expected {
            return Err(anyhow!(
                "server answered {} of {} claims",
                responses.len(),
                expected
            ));
        }
        Ok(responses)
    }

    /// Resolve every source to a unique target, probing all unresolved
    /// sources in lockstep: each round is one batch holding the next request
    /// of every probe still running. Results are in `sources` order; values
    /// that run out of iterations fail individually.
    pub async fn resolve_batch<F>(
        &mut self,
        repository: &str,
        sources: &[String],
        mask: F,
        max_iterations: u32,
    ) -> Result<Vec<Result<Resolved, ResolveError>>>
    where
        F: Fn(&str, u32) -> String,
    {
        let mut probes: Vec<Probe> = sources
            .iter()
            .map(|source| Probe::new(source.as_str(), mask(source.as_str(), 0), max_iterations))
            .collect();

        let mut round = 0u32;
        loop {
            let (indices, requests): (Vec<usize>, Vec<ClaimRequest>) = probes
                .iter_mut()
                .enumerate()
                .filter_map(|(index, probe)| probe.next_request(&mask).map(|r| (index, r)))
                .unzip();
            if requests.is_empty() {
                break;
            }
            debug!(round, pending = requests.len(), "claim round");

            for (chunk_indices, chunk) in indices
                .chunks(MAX_BATCH_SIZE as usize)
                .zip(requests.chunks(MAX_BATCH_SIZE as usize))
            {
                let responses = self.claim_batch(repository, chunk).await?;
                for (index, response) in chunk_indices.iter().zip(&responses) {
                    probes[*index].observe(response);
                }
            }
            round += 1;
        }

        Ok(probes.into_iter().map(Probe::into_result).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_batch_response, read_batch_body, read_opcode};
    use tokio::net::TcpListener;

    fn mask(_source: &str, iteration: u32) -> String {
        if iteration == 0 {
            "XYZ".to_string()
        } else {
            format!("XYZ{}", iteration + 1)
        }
    }

    #[test]
    fn linked_at_first_attempt() {
        let mut probe = Probe::new("alice", "XYZ", 10);
        let request = probe.next_request(&mask).unwrap();
        assert_eq!(request, ClaimRequest::initial("alice", "XYZ"));
        probe.observe(&ClaimResponse::Linked);
        assert!(probe.is_done());
        assert!(probe.next_request(&mask).is_none());
        assert_eq!(
            probe.into_result().unwrap(),
            Resolved {
                source: "alice".into(),
                target: "XYZ".into(),
                iteration: 0
            }
        );
    }

    #[test]
    fn rejection_without_hint_probes_sequentially() {
        let mut probe = Probe::new("bob", "XYZ", 10);
        probe.next_request(&mask);
        probe.observe(&ClaimResponse::Rejected { hint: None });
        assert_eq!(
            probe.state(),
            ProbeState::Probing {
                iteration: 1,
                has_hint: false
            }
        );
        let request = probe.next_request(&mask).unwrap();
        assert_eq!(request, ClaimRequest::retry("bob", "XYZ2", "XYZ", 1));

        probe.observe(&ClaimResponse::Rejected { hint: None });
        let request = probe.next_request(&mask).unwrap();
        assert_eq!(request, ClaimRequest::retry("bob", "XYZ3", "XYZ", 2));
        probe.observe(&ClaimResponse::Linked);
        assert_eq!(probe.state(), ProbeState::Claimed { iteration: 2 });
        assert_eq!(probe.into_result().unwrap().target, "XYZ3");
    }

    #[test]
    fn hint_jumps_to_remembered_iteration() {
        let mut probe = Probe::new("bob", "XYZ", 10);
        probe.next_request(&mask);
        probe.observe(&ClaimResponse::Rejected { hint: Some(4) });
        let request = probe.next_request(&mask).unwrap();
        assert_eq!(request, ClaimRequest::retry("bob", "XYZ5", "XYZ", 4));
    }

    #[test]
    fn zero_hint_counts_as_no_hint() {
        let mut probe = Probe::new("bob", "XYZ", 10);
        probe.next_request(&mask);
        probe.observe(&ClaimResponse::Rejected { hint: Some(0) });
        assert_eq!(
            probe.state(),
            ProbeState::Probing {
                iteration: 1,
                has_hint: false
            }
        );
    }

    #[test]
    fn stale_hint_falls_back_to_next_iteration() {
        let mut probe = Probe::new("bob", "XYZ", 10);
        probe.next_request(&mask);
        probe.observe(&ClaimResponse::Rejected { hint: Some(3) });
        probe.next_request(&mask);
        probe.observe(&ClaimResponse::Rejected { hint: None });
        assert_eq!(
            probe.state(),
            ProbeState::Probing {
                iteration: 4,
                has_hint: false
            }
        );
    }

    #[test]
    fn gives_up_past_max_iterations() {
        let mut probe = Probe::new("bob", "XYZ", 2);
        for _ in 0..3 {
            probe.next_request(&mask);
            probe.observe(&ClaimResponse::Rejected { hint: None });
        }
        assert_eq!(probe.state(), ProbeState::GaveUp);
        assert!(probe.next_request(&mask).is_none());
        assert_eq!(
            probe.into_result().unwrap_err(),
            ResolveError::Exhausted {
                value: "bob".into(),
                max_iterations: 2
            }
        );
    }

    #[test]
    fn hint_beyond_limit_gives_up() {
        let mut probe = Probe::new("bob", "XYZ", 2);
        probe.next_request(&mask);
        probe.observe(&ClaimResponse::Rejected { hint: Some(7) });
        assert_eq!(probe.state(), ProbeState::GaveUp);
    }

    /// Authenticates one client, then answers each batch with the next entry
    /// of `replies` after sleeping for that entry's delay.
    async fn scripted_server(
        replies: Vec<(Duration, ClaimResponse)>,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let authenticator = Authenticator::new("s3cret").unwrap();
            assert!(authenticator.accept(&mut stream).await.unwrap());
            for (delay, reply) in replies {
                let Ok(Some(opcode)) = read_opcode(&mut stream).await else {
                    return;
                };
                if read_batch_body(&mut stream, opcode).await.is_err() {
                    return;
                }
                tokio::time::sleep(delay).await;
                let frame = encode_batch_response(&[reply]).unwrap();
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn late_reply_is_never_matched_to_the_next_batch() {
        let (addr, server) = scripted_server(vec![
            (Duration::from_millis(300), ClaimResponse::Linked),
            (Duration::ZERO, ClaimResponse::Rejected { hint: None }),
        ])
        .await;
        let authenticator = Authenticator::new("s3cret").unwrap();
        let mut client = Client::connect_with(addr, &authenticator, Duration::from_millis(100))
            .await
            .unwrap();

        let first = client
            .claim_batch("R", &[ClaimRequest::initial("alice", "XYZ")])
            .await;
        assert!(first.is_err());
        assert!(client.is_broken());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let second = client
            .claim_batch("R", &[ClaimRequest::initial("bob", "XYZ")])
            .await;
        assert!(second.is_err());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn healthy_connection_stays_usable() {
        let (addr, server) = scripted_server(vec![
            (Duration::ZERO, ClaimResponse::Linked),
            (Duration::ZERO, ClaimResponse::Rejected { hint: Some(2) }),
        ])
        .await;
        let authenticator = Authenticator::new("s3cret").unwrap();
        let mut client = Client::connect_with(addr, &authenticator, Duration::from_secs(5))
            .await
            .unwrap();

        let first = client
            .claim_batch("R", &[ClaimRequest::initial("alice", "XYZ")])
            .await
            .unwrap();
        assert_eq!(first, vec![ClaimResponse::Linked]);
        let second = client
            .claim_batch("R", &[ClaimRequest::initial("bob", "XYZ")])
            .await
            .unwrap();
        assert_eq!(second, vec![ClaimResponse::Rejected { hint: Some(2) }]);
        assert!(!client.is_broken());
        server.await.unwrap();
    }
}
