//! Response routing over a transport without request identifiers.
//!
//! The driver answers requests strictly in the order it receives them, and a
//! line carries nothing that ties it to its request. Matching therefore relies
//! on position alone: the router keeps exactly one exchange in flight and
//! remembers, as [`Debt`], every answer it stopped waiting for.
//!
//! Flow per exchange:
//! 1. Finish writing a request line an earlier call left half-sent; it now
//!    owes an answer, so it joins the debt queue
//! 2. Drain one line per debt entry (stale answers of timed-out calls)
//! 3. Send the request line
//! 4. Race the next line against the caller's deadline
//! 5. On deadline: push the request onto the debt queue and leave the pipe
//!    alone; the driver is still working and its answer is drained later

use std::collections::VecDeque;
use std::future::Future;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{Frame, JsonLinesCodec};
use crate::bridge::protocol::{Request, Response};
use crate::error::{FailureCause, ProtocolViolation};

/// Position of a request on one transport. Local bookkeeping only, never sent.
pub type Seq = u64;

/// An answer the driver still owes for a call that stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleResponse {
    pub seq: Seq,
    pub abandoned_at: Instant,
}

/// Ordered queue of answers abandoned by timed-out calls.
///
/// Between exchanges, `len()` equals the number of calls that timed out after
/// their request reached the driver and whose answer has not been read off
/// the transport yet. A call that times out while draining sends nothing and
/// owes nothing.
#[derive(Debug, Default)]
pub struct Debt {
    queue: VecDeque<StaleResponse>,
}

impl Debt {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn front(&self) -> Option<&StaleResponse> {
        self.queue.front()
    }

    pub fn push(&mut self, seq: Seq) {
        self.queue.push_back(StaleResponse {
            seq,
            abandoned_at: Instant::now(),
        });
    }

    /// Mark the oldest stale answer as read.
    pub fn settle(&mut self) -> Option<StaleResponse> {
        self.queue.pop_front()
    }
}

/// Await `fut`, giving up at `deadline`. `None` when the deadline won.
pub(crate) async fn until<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

pub struct Router<R, W> {
    reader: FramedRead<R, JsonLinesCodec<Response>>,
    writer: FramedWrite<W, JsonLinesCodec<Request>>,
    debt: Debt,
    /// Request whose answer is being awaited. Still set on entry to
    /// `exchange` only if the previous caller was dropped mid-wait.
    in_flight: Option<Seq>,
    /// Request still (partly) sitting in the write buffer.
    unflushed: Option<Seq>,
    next_seq: Seq,
}

impl<R, W> Router<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, JsonLinesCodec::new()),
            writer: FramedWrite::new(writer, JsonLinesCodec::new()),
            debt: Debt::default(),
            in_flight: None,
            unflushed: None,
            next_seq: 0,
        }
    }

    pub fn debt(&self) -> &Debt {
        &self.debt
    }

    /// Answers the driver still owes: queued debt plus requests abandoned by
    /// dropped callers that the next exchange has not accounted for yet.
    pub fn owed(&self) -> usize {
        self.debt.len()
            + usize::from(self.in_flight.is_some())
            + usize::from(self.unflushed.is_some())
    }

    /// Run one drain-send-receive exchange.
    ///
    /// Callers must serialize exchanges; `&mut self` enforces that per router.
    /// The returned future is cancel-safe with respect to response matching:
    /// dropping it at any await point, or hitting the deadline mid-write,
    /// leaves the transport usable and the debt consistent for the next
    /// exchange.
    pub async fn exchange(
        &mut self,
        request: Request,
        deadline: Option<Instant>,
    ) -> Result<serde_json::Value, FailureCause> {
        if let Some(seq) = self.in_flight.take() {
            tracing::debug!(seq, "Previous call dropped before its answer arrived");
            self.debt.push(seq);
        }

        self.flush_unsent(deadline).await?;
        self.drain(deadline).await?;
        let seq = self.send(request, deadline).await?;
        self.receive(seq, deadline).await
    }

    /// Complete the write of a request an earlier call gave up on mid-line.
    ///
    /// The write buffer keeps the unsent bytes, so the line reaches the driver
    /// intact and its answer becomes debt like any other abandoned request.
    async fn flush_unsent(&mut self, deadline: Option<Instant>) -> Result<(), FailureCause> {
        let Some(seq) = self.unflushed else {
            return Ok(());
        };

        match until(deadline, self.writer.flush()).await {
            Some(Ok(())) => {
                self.unflushed = None;
                self.debt.push(seq);
                tracing::debug!(seq, debt = self.debt.len(), "Finished sending abandoned request");
                Ok(())
            }
            Some(Err(e)) => Err(ProtocolViolation::Write(e).into()),
            None => {
                tracing::debug!(seq, "Deadline elapsed while finishing an abandoned request");
                Err(FailureCause::Timeout)
            }
        }
    }

    async fn drain(&mut self, deadline: Option<Instant>) -> Result<(), FailureCause> {
        while let Some(stale) = self.debt.front().copied() {
            match until(deadline, self.reader.next()).await {
                Some(Some(Ok(frame))) => {
                    self.debt.settle();
                    tracing::debug!(
                        seq = stale.seq,
                        late_by = ?stale.abandoned_at.elapsed(),
                        well_formed = matches!(frame, Frame::Valid(_)),
                        remaining = self.debt.len(),
                        "Discarded stale response"
                    );
                }
                Some(Some(Err(e))) => return Err(ProtocolViolation::Read(e).into()),
                Some(None) => return Err(ProtocolViolation::Closed.into()),
                None => {
                    tracing::debug!(
                        pending = self.debt.len(),
                        "Deadline elapsed while draining stale responses"
                    );
                    return Err(FailureCause::Timeout);
                }
            }
        }
        Ok(())
    }

    async fn send(
        &mut self,
        request: Request,
        deadline: Option<Instant>,
    ) -> Result<Seq, FailureCause> {
        let seq = self.next_seq;
        self.next_seq += 1;

        // The write buffer is empty here, so feeding only encodes and never
        // waits on the pipe.
        self.writer
            .feed(request)
            .await
            .map_err(ProtocolViolation::Write)?;
        self.unflushed = Some(seq);

        match until(deadline, self.writer.flush()).await {
            Some(Ok(())) => {
                self.unflushed = None;
                self.in_flight = Some(seq);
                tracing::trace!(seq, "Request sent");
                Ok(seq)
            }
            Some(Err(e)) => Err(ProtocolViolation::Write(e).into()),
            None => {
                tracing::warn!(
                    seq,
                    "Deadline elapsed mid-request, the next call finishes sending it"
                );
                Err(FailureCause::Timeout)
            }
        }
    }

    async fn receive(
        &mut self,
        seq: Seq,
        deadline: Option<Instant>,
    ) -> Result<serde_json::Value, FailureCause> {
        let Some(next) = until(deadline, self.reader.next()).await else {
            self.in_flight = None;
            self.debt.push(seq);
            tracing::warn!(
                seq,
                debt = self.debt.len(),
                "Deadline elapsed before response, answer will be drained by a later call"
            );
            return Err(FailureCause::Timeout);
        };
        self.in_flight = None;

        match next {
            Some(Ok(Frame::Valid(Response::Success { ast }))) => Ok(ast),
            Some(Ok(Frame::Valid(Response::Failure { message }))) => {
                Err(FailureCause::Reported(message))
            }
            Some(Ok(Frame::Invalid { line, error })) => {
                tracing::warn!(seq, %line, %error, "Driver sent a non-protocol line");
                Err(ProtocolViolation::Malformed {
                    line,
                    source: error,
                }
                .into())
            }
            Some(Err(e)) => Err(ProtocolViolation::Read(e).into()),
            None => Err(ProtocolViolation::Closed.into()),
        }
    }
}
