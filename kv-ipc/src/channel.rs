//! Both ends of a command channel: [`Channel`] produces commands, [`Inbox`] consumes them.
//!
//! A synchronous call runs:
//!
//! 1. `mutex` (one producer at a time, released on every exit path),
//! 2. the lazy-start handshake if the worker was never started,
//! 3. `full` (the command area is free),
//! 4. lease a response channel, write envelope and body, post `work`, release `mutex`,
//! 5. wait for the channel's `ready`, copy the response out, unlease.
//!
//! A leaser that stops waiting marks the exchange abandoned, and the worker unleases the channel
//! when it answers.
//!
//! Every wait is cut into slices of the poll interval. Between slices the partner's lifecycle
//! state and pid are probed, and the configured response timeout bounds the whole call.
use std::time::{Duration, Instant};

use kv_shm::{Semaphore, TimedWait};

use crate::config::IpcConfig;
use crate::control::{ControlBlock, ResponseSync};
use crate::error::Error;
use crate::frame::{FrameError, FrameReader, FrameWriter};
use crate::message::{DatabaseId, Envelope, Reply, Request, Status, WorkerId, NO_CHANNEL};
use crate::names::Endpoint;
use crate::response::ResponsePool;

pub struct Channel {
    endpoint: Endpoint,
    control: ControlBlock,
    responses: ResponsePool,
    database: DatabaseId,
    timeout: Option<Duration>,
    poll: Duration,
}

/// A complete response, copied out of its buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub envelope: Envelope,
    pub body: Vec<u8>,
}

/// A command copied out of the command area.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Incoming {
    pub envelope: Envelope,
    pub body: Vec<u8>,
}

/// Posts a semaphore when dropped, unless disarmed.
struct PostGuard<'a> {
    sem: &'a Semaphore,
    armed: bool,
}

impl<'a> PostGuard<'a> {
    fn new(sem: &'a Semaphore) -> Self {
        PostGuard { sem, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PostGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.sem.post() {
                tracing::error!(%err, "could not release semaphore");
            }
        }
    }
}

impl Channel {
    /// Provision the control block and response buffers of `endpoint`. The channel owns them.
    pub fn create(config: &IpcConfig, endpoint: Endpoint) -> Result<Self, Error> {
        config.validate()?;
        let name = config.control_name(endpoint);
        // Buffers first: a published control block implies its buffers exist.
        let responses = ResponsePool::create(&name, config.channels, config.frame_capacity)?;
        let control = ControlBlock::create(&name, config.channels, config.frame_capacity)?;
        Ok(Channel::new(config, endpoint, control, responses))
    }

    /// Attach to the channel of `endpoint` provisioned by somebody else.
    pub fn open(config: &IpcConfig, endpoint: Endpoint) -> Result<Self, Error> {
        let control = ControlBlock::open(&config.control_name(endpoint))?;
        let responses = ResponsePool::open(&control)?;
        Ok(Channel::new(config, endpoint, control, responses))
    }

    fn new(
        config: &IpcConfig,
        endpoint: Endpoint,
        control: ControlBlock,
        responses: ResponsePool,
    ) -> Self {
        Channel {
            endpoint,
            control,
            responses,
            database: config.database,
            timeout: config.response_timeout,
            poll: config.poll_interval,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn control(&self) -> &ControlBlock {
        &self.control
    }

    /// The largest body a request to this channel may carry.
    pub fn max_body(&self) -> usize {
        self.control.frame_capacity() - Envelope::LEN
    }

    /// Send a request and wait for its response.
    ///
    /// `target` is the worker the operation is about. A response with status `Exception` is
    /// turned into [`Error::Exception`]; `Success` and `Failure` are returned as they are.
    pub fn call(&self, target: WorkerId, request: &Request<'_>) -> Result<Response, Error> {
        self.call_within(target, request, self.timeout)
    }

    pub fn call_within(
        &self,
        target: WorkerId,
        request: &Request<'_>,
        timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        let start = Instant::now();
        let deadline = timeout.map(|timeout| start + timeout);

        let channel = self.produce(target, request, true, start, deadline)?;

        // From here on the worker owns the buffer until it signals readiness.
        if let Err(err) = self.wait_ready(channel, start, deadline) {
            let sync = self.response_sync(channel)?;
            if sync.abandon() {
                // The worker returns the channel to the pool once it gets to answering.
                tracing::warn!(%err, channel, endpoint = %self.endpoint, "abandoning response channel");
                return Err(err);
            }

            // Answered just in time: `ready` is posted right behind the answer.
            self.wait_live(&sync.ready, start, None)?;
        }

        let lease = PostGuard::new(self.lease_lock(channel)?);
        let response = self.read_response(channel);
        drop(lease);

        let response = response?;
        match response.envelope.status {
            Status::Exception => Err(Error::Exception(
                String::from_utf8_lossy(&response.body).into_owned(),
            )),
            _ => Ok(response),
        }
    }

    /// Send a request that is not answered.
    pub fn send(&self, target: WorkerId, request: &Request<'_>) -> Result<(), Error> {
        self.send_within(target, request, self.timeout)
    }

    pub fn send_within(
        &self,
        target: WorkerId,
        request: &Request<'_>,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let start = Instant::now();
        let deadline = timeout.map(|timeout| start + timeout);
        self.produce(target, request, false, start, deadline)?;
        Ok(())
    }

    fn response_sync(&self, channel: u32) -> Result<&ResponseSync, Error> {
        self.control
            .response_sync(channel)
            .ok_or(Error::Protocol(FrameError::UnknownChannel(channel)))
    }

    fn lease_lock(&self, channel: u32) -> Result<&Semaphore, Error> {
        Ok(&self.response_sync(channel)?.lock)
    }

    /// Place one command into the area. Returns the leased channel, or [`NO_CHANNEL`].
    fn produce(
        &self,
        target: WorkerId,
        request: &Request<'_>,
        respond: bool,
        start: Instant,
        deadline: Option<Instant>,
    ) -> Result<u32, Error> {
        let body_len = request.body_len();
        let needed = Envelope::LEN.saturating_add(body_len);
        let capacity = self.control.frame_capacity();

        if needed > capacity {
            return Err(FrameError::Overflow { needed, capacity }.into());
        }

        self.wait_live(self.control.mutex(), start, deadline)?;
        let _mutex = PostGuard::new(self.control.mutex());

        if !self.control.is_started() {
            self.start_partner(start, deadline)?;
        }

        self.wait_live(self.control.full(), start, deadline)?;
        let full = PostGuard::new(self.control.full());

        let channel = if respond {
            match self.responses.lease(&self.control, deadline)? {
                Some(channel) => channel,
                None => {
                    return Err(Error::Timeout {
                        endpoint: self.endpoint,
                        waited: start.elapsed(),
                    })
                }
            }
        } else {
            NO_CHANNEL
        };

        let lease = if respond {
            Some(PostGuard::new(self.lease_lock(channel)?))
        } else {
            None
        };

        let envelope = Envelope::request(
            request.op(),
            channel,
            self.database,
            target,
            body_len as u64,
        );

        // Safety: holding `full` makes us the only party touching the area.
        let area = unsafe { self.control.area_mut() };
        let mut w = FrameWriter::new(area);
        envelope.encode(&mut w)?;
        request.encode_body(&mut w)?;

        tracing::trace!(op = ?envelope.op, channel, target, size = body_len, "command produced");

        self.control.work().post()?;
        // The consumer posts `full` after copying the command out; the lease ends with the
        // response. Only the producer mutex is released here.
        full.disarm();
        if let Some(lease) = lease {
            lease.disarm();
        }

        Ok(channel)
    }

    /// The lazy-start handshake. Runs while holding `mutex`, so there is one starter at a time.
    fn start_partner(&self, start: Instant, deadline: Option<Instant>) -> Result<(), Error> {
        let worker = match self.endpoint {
            Endpoint::Worker(id) => id,
            Endpoint::Manager => return Err(Error::PartnerGone { endpoint: self.endpoint }),
        };

        tracing::info!(worker, "requesting worker start");
        self.control.agent(0).post()?;
        self.wait_until(self.control.agent(1), start, deadline)?;

        if !self.control.is_started() {
            return Err(Error::LaunchFailed { worker });
        }

        Ok(())
    }

    fn wait_ready(&self, channel: u32, start: Instant, deadline: Option<Instant>) -> Result<(), Error> {
        self.wait_live(&self.response_sync(channel)?.ready, start, deadline)
    }

    fn read_response(&self, channel: u32) -> Result<Response, Error> {
        let buffer = self
            .responses
            .buffer(channel)
            .ok_or(Error::Protocol(FrameError::UnknownChannel(channel)))?;

        // Safety: `ready` was observed and the lease is still held.
        let mut r = FrameReader::new(unsafe { buffer.as_slice() });
        let envelope = Envelope::decode(&mut r)?;

        if envelope.channel != channel {
            return Err(FrameError::Misrouted {
                expected: channel,
                found: envelope.channel,
            }
            .into());
        }

        let size = usize::try_from(envelope.size).unwrap_or(usize::MAX);
        let body = r.read_bytes(size)?.to_vec();

        Ok(Response { envelope, body })
    }

    /// Timed wait with liveness probes between slices.
    fn wait_live(&self, sem: &Semaphore, start: Instant, deadline: Option<Instant>) -> Result<(), Error> {
        loop {
            if self.wait_slice(sem, start, deadline)? == TimedWait::Acquired {
                return Ok(());
            }

            if !self.control.is_alive() {
                return Err(Error::PartnerGone {
                    endpoint: self.endpoint,
                });
            }
        }
    }

    /// Timed wait without liveness probes, for the start handshake where no partner exists yet.
    fn wait_until(&self, sem: &Semaphore, start: Instant, deadline: Option<Instant>) -> Result<(), Error> {
        while self.wait_slice(sem, start, deadline)? != TimedWait::Acquired {}
        Ok(())
    }

    fn wait_slice(
        &self,
        sem: &Semaphore,
        start: Instant,
        deadline: Option<Instant>,
    ) -> Result<TimedWait, Error> {
        let slice = match deadline {
            None => self.poll,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(Error::Timeout {
                        endpoint: self.endpoint,
                        waited: start.elapsed(),
                    });
                }
                left.min(self.poll)
            }
        };

        Ok(sem.wait_timeout(slice)?)
    }
}

/// The consuming end of a channel, driven by a single thread.
pub struct Inbox {
    channel: Channel,
}

impl Inbox {
    pub fn new(channel: Channel) -> Self {
        Inbox { channel }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn control(&self) -> &ControlBlock {
        &self.channel.control
    }

    /// Wait up to `timeout` for the next command and copy it out of the area.
    ///
    /// The area is handed back to producers before this returns, whether or not the command
    /// could be read. An unreadable envelope is a protocol violation.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Incoming>, Error> {
        let control = &self.channel.control;

        if control.work().wait_timeout(timeout)? == TimedWait::TimedOut {
            return Ok(None);
        }

        let _full = PostGuard::new(control.full());
        // Safety: a posted `work` hands us the area until `full` is posted.
        let area = unsafe { control.area() };
        let mut r = FrameReader::new(area);
        let envelope = Envelope::decode(&mut r)?;

        let size = usize::try_from(envelope.size)
            .ok()
            .filter(|&size| size <= r.remaining())
            .ok_or(FrameError::Overflow {
                needed: Envelope::LEN.saturating_add(envelope.size as usize),
                capacity: area.len(),
            })?;

        let body = r.read_bytes(size)?.to_vec();
        Ok(Some(Incoming { envelope, body }))
    }

    /// Answer `request` on its leased channel. Commands sent without a channel are not answered.
    pub fn reply(&self, request: &Envelope, reply: &Reply) -> Result<(), Error> {
        if request.channel == NO_CHANNEL {
            return Ok(());
        }

        let channel = request.channel;
        let buffer = self
            .channel
            .responses
            .buffer(channel)
            .ok_or(FrameError::UnknownChannel(channel))?;

        // Safety: the channel is leased and not yet signaled, the buffer is ours.
        let buf = unsafe { buffer.as_mut_slice() };

        if let Err(err) = write_response(buf, request, reply.status, &reply.body) {
            tracing::warn!(%err, op = ?request.op, "response does not fit its buffer");
            let message = format!("response of {} bytes: {err}", reply.body.len());
            write_response(buf, request, Status::Exception, message.as_bytes())?;
        }

        let waiting = self
            .channel
            .responses
            .signal_ready(&self.channel.control, channel)?;
        if !waiting {
            tracing::debug!(channel, op = ?request.op, "leaser gave up, channel returned to the pool");
        }
        Ok(())
    }
}

fn write_response(
    buf: &mut [u8],
    request: &Envelope,
    status: Status,
    body: &[u8],
) -> Result<(), FrameError> {
    let mut w = FrameWriter::new(buf);
    request.response(status, body.len() as u64).encode(&mut w)?;
    w.write_bytes(body)
}
