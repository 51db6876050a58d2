//! The forwarding engine: a single-threaded, readiness-driven event loop that
//! multiplexes the interface descriptor with the two transport descriptors
//! (SPEC_FULL.md §4.4). This is the core of the crate.

use std::os::fd::{BorrowedFd, RawFd};

use bytestruct::{ReadFrom, WriteTo};
use nix::poll::{poll, PollFd, PollFlags};
use slog::Logger;

use crate::compress;
use crate::error::EngineError;
use crate::framing::{self, TakeUnit};
use crate::params::{CompressFlagWire, TransportParameters, TunnelModeWire};
use crate::ringbuf::RingBuffer;

pub struct EngineConfig {
    pub compress: bool,
    pub max_frame_size: u16,
    pub tunnel_mode_wire: TunnelModeWire,
    pub if_buffer_size: usize,
    pub tr_buffer_size: usize,
}

/// Owns the interface and transport descriptors and the four buffers for one session.
pub struct ForwardingEngine {
    if_fd: RawFd,
    tr_in_fd: RawFd,
    tr_out_fd: RawFd,
    ifr: RingBuffer,
    ifw: RingBuffer,
    trr: RingBuffer,
    trs: RingBuffer,
    compress: bool,
    max_frame_size: u16,
    peer_params: Option<TransportParameters>,
    logger: Logger,
}

impl ForwardingEngine {
    pub fn new(if_fd: RawFd, tr_in_fd: RawFd, tr_out_fd: RawFd, cfg: EngineConfig, logger: Logger) -> Self {
        let mut engine = ForwardingEngine {
            if_fd,
            tr_in_fd,
            tr_out_fd,
            ifr: RingBuffer::with_capacity(cfg.if_buffer_size),
            ifw: RingBuffer::with_capacity(cfg.if_buffer_size),
            trr: RingBuffer::with_capacity(cfg.tr_buffer_size),
            trs: RingBuffer::with_capacity(cfg.tr_buffer_size),
            compress: cfg.compress,
            max_frame_size: cfg.max_frame_size,
            peer_params: None,
            logger,
        };
        engine.queue_parameter_unit(cfg.tunnel_mode_wire);
        engine
    }

    /// The peer's negotiated parameters, once the initial unit has arrived. Recorded for
    /// diagnostics only; a mismatch with the local configuration is never treated as an error.
    pub fn peer_params(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }

    fn queue_parameter_unit(&mut self, ifmode: TunnelModeWire) {
        let params = TransportParameters {
            ifmode,
            compflag: if self.compress { CompressFlagWire::Compress } else { CompressFlagWire::None },
            max_frame_size: self.max_frame_size,
        };
        let mut body = Vec::with_capacity(4);
        params.write_to(&mut body).expect("writing the parameter trailer into a Vec cannot fail");

        let slot = self.trs.writable();
        framing::encode_prefix(slot, 0);
        slot[framing::PREFIX_LEN..framing::PREFIX_LEN + body.len()].copy_from_slice(&body);
        self.trs.append(framing::PREFIX_LEN + body.len());
    }

    /// Runs the event loop until either direction cleanly ends, a fatal error occurs, or the
    /// session quiesces with no possible further progress.
    pub fn run(&mut self) -> Result<(), EngineError> {
        loop {
            self.packetize_outbound();
            self.depacketize_inbound()?;

            let if_read_room = self.ifr.free() >= framing::PREFIX_LEN + self.max_frame_size as usize;
            let if_write_ready = !self.ifw.is_empty();
            let tr_read_room = self.trr.free() > 0;
            let tr_write_ready = !self.trs.is_empty();

            if !if_read_room && !if_write_ready && !tr_read_room && !tr_write_ready {
                slog::info!(self.logger, "session quiesced, no further progress possible");
                return Ok(());
            }

            let tr_in = unsafe { BorrowedFd::borrow_raw(self.tr_in_fd) };
            let tr_out = unsafe { BorrowedFd::borrow_raw(self.tr_out_fd) };
            let if_borrow = unsafe { BorrowedFd::borrow_raw(self.if_fd) };

            let mut fds = Vec::with_capacity(3);
            let tr_in_idx = tr_read_room.then(|| {
                fds.push(PollFd::new(tr_in, PollFlags::POLLIN));
                fds.len() - 1
            });
            let tr_out_idx = tr_write_ready.then(|| {
                fds.push(PollFd::new(tr_out, PollFlags::POLLOUT));
                fds.len() - 1
            });
            let mut if_flags = PollFlags::empty();
            if if_read_room {
                if_flags |= PollFlags::POLLIN;
            }
            if if_write_ready {
                if_flags |= PollFlags::POLLOUT;
            }
            let if_idx = (!if_flags.is_empty()).then(|| {
                fds.push(PollFd::new(if_borrow, if_flags));
                fds.len() - 1
            });

            poll(&mut fds, -1).map_err(|e| EngineError::Fatal(std::io::Error::from(e)))?;

            // A pipe reports a closed, drained write end as POLLHUP with POLLIN clear (unlike
            // select(2), which always reports such a descriptor as readable). Treat POLLHUP and
            // POLLERR as read-actionable too, so the read() call that observes EOF/the error
            // still runs instead of poll() being re-issued against the same revents forever.
            let readable = |revents: PollFlags| {
                revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
            };

            // Perform exactly one I/O operation this iteration, in tr-read, if-write, if-read,
            // tr-write order, then loop back to re-run phases A and B.
            if let Some(i) = tr_in_idx {
                if fds[i].revents().is_some_and(readable) {
                    if !self.read_transport()? {
                        return Ok(());
                    }
                    continue;
                }
            }
            if let Some(i) = if_idx {
                if fds[i].revents().is_some_and(|r| r.contains(PollFlags::POLLOUT)) {
                    self.write_interface()?;
                    continue;
                }
            }
            if let Some(i) = if_idx {
                if fds[i].revents().is_some_and(readable) {
                    if !self.read_interface()? {
                        return Ok(());
                    }
                    continue;
                }
            }
            if let Some(i) = tr_out_idx {
                if fds[i].revents().is_some_and(|r| r.contains(PollFlags::POLLOUT)) {
                    self.write_transport()?;
                    continue;
                }
            }
        }
    }

    /// Phase A: move complete interface frames into the transport-send buffer.
    fn packetize_outbound(&mut self) {
        loop {
            let (payload, consumed) = match framing::try_take_unit(self.ifr.filled()) {
                TakeUnit::Unit { payload, consumed } => (payload, consumed),
                TakeUnit::NeedMore => return,
            };
            let payload_len = payload.len();
            let needed = framing::PREFIX_LEN
                + if self.compress { compress::max_compressed_size(payload_len) } else { payload_len };
            if self.trs.free() < needed {
                return;
            }

            let dst = self.trs.writable();
            let out_len = if self.compress {
                match compress::compress(payload, &mut dst[framing::PREFIX_LEN..]) {
                    Ok(n) => n,
                    Err(e) => {
                        slog::warn!(self.logger, "dropping outbound frame, compression failed"; "error" => %e);
                        self.ifr.drain(consumed);
                        continue;
                    }
                }
            } else {
                dst[framing::PREFIX_LEN..framing::PREFIX_LEN + payload_len].copy_from_slice(payload);
                payload_len
            };
            framing::encode_prefix(dst, out_len as u16);

            self.ifr.drain(consumed);
            self.trs.append(framing::PREFIX_LEN + out_len);
        }
    }

    /// Phase B: move complete transport units into the interface-write buffer, consuming the
    /// parameter unit if it is the next one pending.
    fn depacketize_inbound(&mut self) -> Result<(), EngineError> {
        loop {
            let (unit_len, consumed, is_param) = match framing::try_take_unit(self.trr.filled()) {
                TakeUnit::Unit { payload, consumed } if payload.is_empty() => (0usize, consumed, true),
                TakeUnit::Unit { payload, consumed } => (payload.len(), consumed, false),
                TakeUnit::NeedMore => return Ok(()),
            };

            if is_param {
                const TRAILER_LEN: usize = 4;
                if self.trr.len() < framing::PREFIX_LEN + TRAILER_LEN {
                    return Ok(());
                }
                if self.peer_params.is_some() {
                    return Err(EngineError::Protocol("a second parameter unit was received"));
                }
                let trailer = &self.trr.filled()[framing::PREFIX_LEN..framing::PREFIX_LEN + TRAILER_LEN];
                let params = TransportParameters::read_from(&mut &trailer[..])
                    .map_err(|_| EngineError::Protocol("the parameter unit trailer is malformed"))?;
                slog::info!(self.logger, "received peer parameters";
                    "ifmode" => ?params.ifmode, "compflag" => ?params.compflag, "max_frame_size" => params.max_frame_size);
                self.peer_params = Some(params);
                self.trr.drain(framing::PREFIX_LEN + TRAILER_LEN);
                continue;
            }

            let unit = &self.trr.filled()[framing::PREFIX_LEN..framing::PREFIX_LEN + unit_len];

            if self.compress {
                let out_len = match compress::uncompressed_size(unit) {
                    Ok(n) => n,
                    Err(e) => {
                        slog::warn!(self.logger, "dropping inbound unit, malformed compressed block"; "error" => %e);
                        self.trr.drain(consumed);
                        continue;
                    }
                };
                if self.ifw.free() < framing::PREFIX_LEN + out_len {
                    return Ok(());
                }
                let dst = self.ifw.writable();
                match compress::uncompress(unit, &mut dst[framing::PREFIX_LEN..framing::PREFIX_LEN + out_len]) {
                    Ok(n) => {
                        framing::encode_prefix(dst, n as u16);
                        self.ifw.append(framing::PREFIX_LEN + n);
                    }
                    Err(e) => {
                        slog::warn!(self.logger, "dropping inbound unit, decompression failed"; "error" => %e);
                    }
                }
            } else {
                if self.ifw.free() < framing::PREFIX_LEN + unit_len {
                    return Ok(());
                }
                let dst = self.ifw.writable();
                framing::encode_prefix(dst, unit_len as u16);
                dst[framing::PREFIX_LEN..framing::PREFIX_LEN + unit_len].copy_from_slice(unit);
                self.ifw.append(framing::PREFIX_LEN + unit_len);
            }
            self.trr.drain(consumed);
        }
    }

    fn read_transport(&mut self) -> Result<bool, EngineError> {
        loop {
            match nix::unistd::read(self.tr_in_fd, self.trr.writable()) {
                Ok(0) => {
                    slog::info!(self.logger, "transport reached end of stream");
                    return Ok(false);
                }
                Ok(n) => {
                    self.trr.append(n);
                    return Ok(true);
                }
                Err(nix::Error::EINTR) => continue,
                Err(nix::Error::EAGAIN) => return Ok(true),
                Err(e) => return Err(EngineError::Fatal(std::io::Error::from(e))),
            }
        }
    }

    fn write_transport(&mut self) -> Result<(), EngineError> {
        match nix::unistd::write(self.tr_out_fd, self.trs.filled()) {
            Ok(n) => {
                self.trs.drain(n);
                Ok(())
            }
            Err(nix::Error::EINTR) | Err(nix::Error::EAGAIN) => Ok(()),
            Err(e) => Err(EngineError::Fatal(std::io::Error::from(e))),
        }
    }

    fn read_interface(&mut self) -> Result<bool, EngineError> {
        let max_frame = self.max_frame_size as usize;
        let slot = self.ifr.writable();
        let room = slot.len() - framing::PREFIX_LEN;
        let n_max = room.min(max_frame);

        match nix::unistd::read(self.if_fd, &mut slot[framing::PREFIX_LEN..framing::PREFIX_LEN + n_max]) {
            Ok(0) => {
                slog::info!(self.logger, "interface reached end of stream");
                Ok(false)
            }
            Ok(n) => {
                framing::encode_prefix(slot, n as u16);
                self.ifr.append(framing::PREFIX_LEN + n);
                Ok(true)
            }
            Err(nix::Error::EINTR) | Err(nix::Error::EAGAIN) => Ok(true),
            Err(e) => Err(EngineError::Fatal(std::io::Error::from(e))),
        }
    }

    fn write_interface(&mut self) -> Result<(), EngineError> {
        let (payload, consumed) = match framing::try_take_unit(self.ifw.filled()) {
            TakeUnit::Unit { payload, consumed } => (payload, consumed),
            TakeUnit::NeedMore => return Ok(()),
        };
        let wanted = payload.len();

        match nix::unistd::write(self.if_fd, payload) {
            Ok(n) => {
                if n < wanted {
                    slog::warn!(self.logger, "short write to interface, remainder dropped";
                        "wanted" => wanted, "wrote" => n);
                }
                self.ifw.drain(consumed);
                Ok(())
            }
            Err(nix::Error::EINTR) | Err(nix::Error::EAGAIN) => Ok(()),
            Err(e) => Err(EngineError::Fatal(std::io::Error::from(e))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn logger() -> Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn make_pipe() -> (RawFd, RawFd) {
        nix::unistd::pipe().unwrap()
    }

    #[test]
    fn queues_a_parameter_unit_on_construction() {
        let (if_r, if_w) = make_pipe();
        let (tr_r, tr_w) = make_pipe();
        let engine = ForwardingEngine::new(
            if_w,
            tr_r,
            tr_w,
            EngineConfig {
                compress: false,
                max_frame_size: 1500,
                tunnel_mode_wire: TunnelModeWire::L3,
                if_buffer_size: 4096,
                tr_buffer_size: 4096,
            },
            logger(),
        );
        assert_eq!(engine.trs.filled(), &[0u8, 0u8, 1u8, 1u8, 0x05, 0xdc]);
        let _ = if_r;
    }

    #[test]
    fn packetizes_a_complete_frame_without_compression() {
        let (if_r, if_w) = make_pipe();
        let (tr_r, tr_w) = make_pipe();
        let mut engine = ForwardingEngine::new(
            if_w,
            tr_r,
            tr_w,
            EngineConfig {
                compress: false,
                max_frame_size: 1500,
                tunnel_mode_wire: TunnelModeWire::L3,
                if_buffer_size: 4096,
                tr_buffer_size: 4096,
            },
            logger(),
        );
        engine.trs.drain(engine.trs.len());

        let slot = engine.ifr.writable();
        framing::encode_prefix(slot, 5);
        slot[2..7].copy_from_slice(b"hello");
        engine.ifr.append(7);

        engine.packetize_outbound();

        assert_eq!(engine.trs.filled(), &[0u8, 5u8, b'h', b'e', b'l', b'l', b'o']);
        assert!(engine.ifr.is_empty());
        let _ = if_r;
    }

    #[test]
    fn backpressure_withholds_consumption_when_sink_is_full() {
        let (if_r, if_w) = make_pipe();
        let (tr_r, tr_w) = make_pipe();
        let mut engine = ForwardingEngine::new(
            if_w,
            tr_r,
            tr_w,
            EngineConfig {
                compress: false,
                max_frame_size: 1500,
                tunnel_mode_wire: TunnelModeWire::L3,
                if_buffer_size: 4096,
                tr_buffer_size: 8,
            },
            logger(),
        );
        // the parameter unit already consumed 6 of the 8 available bytes.
        let slot = engine.ifr.writable();
        framing::encode_prefix(slot, 5);
        slot[2..7].copy_from_slice(b"hello");
        engine.ifr.append(7);

        engine.packetize_outbound();

        assert!(!engine.ifr.is_empty(), "frame should remain buffered until the sink has room");
        let _ = if_r;
    }
}
