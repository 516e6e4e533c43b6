//! Connection state, reply correlation and the dispatch loop.
//!
//! A [`Connection`] owns one transport, one signing context and the table of
//! in-flight requests keyed by MID. The design is single-threaded and
//! cooperative: there is no reader thread, instead every [`Connection::wait`]
//! pulls frames off the transport and dispatches them to whichever pending
//! request they belong to, so a caller waiting on one reply still services
//! replies, oplock breaks and transaction fragments for everything else.

pub mod signing;
pub mod transport;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::packets::header::{Command, Status};
use crate::packets::trans::{
    write_primary, write_secondary, PrimaryFields, SecondaryFields, TransFamily,
};
use crate::packets::wire::{ReceivedPacket, WireBuf, WireStr};
use crate::request::{Request, RequestState, Session, Tree};
use crate::trans::{TransReassembly, TransReply, TransRequest};
use signing::SigningContext;
use transport::Transport;

/// MID reserved for server-initiated packets such as oplock breaks.
const MID_RESERVED: u16 = 0xFFFF;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Negotiated maximum packet size; fragments are cut against this.
    pub max_xmit: u32,
    /// Process id stamped into outgoing headers.
    pub pid: u16,
    /// Default reply timeout, overridable per request.
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            max_xmit: 4356,
            pid: std::process::id() as u16,
            timeout: Duration::from_secs(20),
        }
    }
}

/// Callback invoked for server-initiated oplock break notifications.
pub type OplockHandler = Box<dyn FnMut(&ReceivedPacket)>;

enum SlotState {
    /// Plain request, reply not yet seen.
    Waiting,
    /// Transaction, reply fragments being collected.
    Reassembling(TransReassembly),
    Ready(Completion),
    Failed(crate::Error),
}

enum Completion {
    Packet(ReceivedPacket),
    Trans(TransReply),
}

struct PendingSlot {
    command: Command,
    uid: u16,
    tid: u16,
    /// Sequence number the next reply fragment must be signed with.
    reply_seq: Option<u32>,
    deadline: Instant,
    state: SlotState,
}

pub struct Connection {
    transport: Box<dyn Transport>,
    signing: SigningContext,
    config: ConnectionConfig,
    next_mid: u16,
    pending: HashMap<u16, PendingSlot>,
    oplock_handler: Option<OplockHandler>,
    dead: bool,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, config: ConnectionConfig) -> Connection {
        Connection {
            transport,
            signing: SigningContext::new(),
            config,
            next_mid: rand::thread_rng().gen(),
            pending: HashMap::new(),
            oplock_handler: None,
            dead: false,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.dead
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Changes the process id stamped into subsequent requests. Some
    /// operations (notably locking) are scoped to the pid on the wire.
    pub fn set_pid(&mut self, pid: u16) {
        self.config.pid = pid;
    }

    pub fn set_oplock_handler(&mut self, handler: OplockHandler) {
        self.oplock_handler = Some(handler);
    }

    /// Switches outgoing packets to the session-setup signing placeholder.
    pub fn set_fixed_token(&mut self) -> crate::Result<()> {
        self.signing.set_fixed_token()
    }

    /// Activates packet signing. See [`SigningContext::begin_signing`].
    pub fn begin_signing(&mut self, session_key: &[u8], response: &[u8]) -> crate::Result<()> {
        self.signing.begin_signing(session_key, response)
    }

    /// Next signing sequence number. Diagnostic.
    pub fn next_sequence(&self) -> u32 {
        self.signing.next_sequence()
    }

    fn alloc_mid(&mut self) -> u16 {
        loop {
            let mid = self.next_mid;
            self.next_mid = self.next_mid.wrapping_add(1);
            if mid != MID_RESERVED && !self.pending.contains_key(&mid) {
                return mid;
            }
        }
    }

    fn build(
        &self,
        session: &Session,
        tree: &Tree,
        command: Command,
        word_count: u8,
        data_len: usize,
        mid: u16,
    ) -> crate::Result<WireBuf> {
        let mut buf = WireBuf::allocate(command, word_count, data_len)?;
        let pid = self.config.pid;
        let uid = session.uid;
        let tid = tree.tid;
        buf.with_header(|header| {
            header.uid = uid;
            header.tid = tid;
            header.pid = pid;
            header.mid = mid;
        })?;
        Ok(buf)
    }

    /// Starts a new request: allocates a fresh MID and stamps the session,
    /// tree and process identifiers into the header.
    pub fn setup(
        &mut self,
        session: &Session,
        tree: &Tree,
        command: Command,
        word_count: u8,
        data_len: usize,
    ) -> crate::Result<Request> {
        if self.dead {
            return Err(crate::Error::TransportClosed);
        }
        let mid = self.alloc_mid();
        let buf = self.build(session, tree, command, word_count, data_len, mid)?;
        Ok(Request::new(mid, command, buf))
    }

    fn sign_and_send(&mut self, mut bytes: Vec<u8>, one_way: bool) -> crate::Result<Option<u32>> {
        let seq = self.signing.seq_alloc(one_way);
        self.signing.sign(&mut bytes, seq)?;
        self.transport.send_frame(&bytes)?;
        // A one-way packet has no reply to verify against.
        Ok(if one_way { None } else { seq.map(|s| s + 1) })
    }

    /// Sends a request and registers it for reply correlation. Returns the
    /// MID to pass to [`Connection::wait`]. One-way requests are not
    /// registered and their MID is immediately dead.
    pub fn send(&mut self, mut request: Request) -> crate::Result<u16> {
        if self.dead {
            return Err(crate::Error::TransportClosed);
        }
        let mid = request.mid();
        let command = request.command();
        let one_way = request.is_one_way();
        let timeout = request.timeout().unwrap_or(self.config.timeout);
        let header = request.buf().header()?;

        request.set_state(RequestState::Sent);
        let reply_seq = match self.sign_and_send(request.into_buf().into_bytes(), one_way) {
            Ok(seq) => seq,
            Err(e) => {
                self.dead = true;
                return Err(e);
            }
        };
        log::debug!("Sent {} with MID {:#06x}.", command, mid);

        if !one_way {
            let state = match TransFamily::of_command(command) {
                Some(family) => SlotState::Reassembling(TransReassembly::new(family)),
                None => SlotState::Waiting,
            };
            self.pending.insert(
                mid,
                PendingSlot {
                    command,
                    uid: header.uid,
                    tid: header.tid,
                    reply_seq,
                    deadline: Instant::now() + timeout,
                    state,
                },
            );
        }
        Ok(mid)
    }

    /// Requests server-side cancellation of a pending request. The cancel
    /// packet reuses the MID of the request it targets and expects no reply
    /// of its own; the original request typically completes with
    /// [`crate::Error::OperationCanceled`].
    pub fn cancel(&mut self, mid: u16) -> crate::Result<()> {
        if self.dead {
            return Err(crate::Error::TransportClosed);
        }
        let slot = self
            .pending
            .get(&mid)
            .ok_or(crate::Error::CorrelationNotFound(mid))?;
        let session = Session { uid: slot.uid };
        let tree = Tree { tid: slot.tid };
        let buf = self.build(&session, &tree, Command::NtCancel, 0, 0, mid)?;
        self.sign_and_send(buf.into_bytes(), true)?;
        log::debug!("Sent cancel for MID {:#06x}.", mid);
        Ok(())
    }

    /// Acknowledges a server oplock break, releasing the oplock down to
    /// `level` (0 = none, 1 = level II). The acknowledgment is a one-way
    /// LockingX on the reserved MID; the server does not answer it.
    pub fn ack_oplock_break(
        &mut self,
        notification: &ReceivedPacket,
        level: u8,
    ) -> crate::Result<()> {
        if self.dead {
            return Err(crate::Error::TransportClosed);
        }
        let fid = notification.block()?.word_u16(4)?;
        let session = Session {
            uid: notification.header.uid,
        };
        let tree = Tree {
            tid: notification.header.tid,
        };
        let mut buf = self.build(&session, &tree, Command::LockingX, 8, 0, MID_RESERVED)?;
        buf.put_word_u8(0, Command::NoCommand as u8)?;
        buf.put_word_u16(4, fid)?;
        // Lock type: oplock release, with the retained level in the high byte.
        buf.put_word_u16(6, 0x0002 | (level as u16) << 8)?;
        self.sign_and_send(buf.into_bytes(), true)?;
        log::debug!("Acknowledged oplock break on fid {:#06x}.", fid);
        Ok(())
    }

    /// Blocks until the reply for `mid` arrives, servicing the connection in
    /// the meantime. On timeout the request is forgotten; a late reply will
    /// be discarded as unknown.
    pub fn wait(&mut self, mid: u16) -> crate::Result<ReceivedPacket> {
        match self.wait_slot(mid)? {
            Completion::Packet(packet) => Ok(packet),
            Completion::Trans(_) => Err(crate::Error::InvalidState(
                "Transaction replies are collected by transact".into(),
            )),
        }
    }

    fn wait_slot(&mut self, mid: u16) -> crate::Result<Completion> {
        loop {
            match self.pending.remove(&mid) {
                None => {
                    return Err(if self.dead {
                        crate::Error::TransportClosed
                    } else {
                        crate::Error::CorrelationNotFound(mid)
                    })
                }
                Some(PendingSlot {
                    state: SlotState::Ready(completion),
                    ..
                }) => return Ok(completion),
                Some(PendingSlot {
                    state: SlotState::Failed(e),
                    ..
                }) => return Err(e),
                Some(slot) => {
                    self.pending.insert(mid, slot);
                }
            }
            self.pump(mid)?;
        }
    }

    /// Receives and dispatches one frame, respecting `mid`'s deadline.
    fn pump(&mut self, mid: u16) -> crate::Result<()> {
        let deadline = self
            .pending
            .get(&mid)
            .map(|slot| slot.deadline)
            .unwrap_or_else(Instant::now);
        let remaining = deadline.checked_duration_since(Instant::now());
        let Some(remaining) = remaining else {
            self.pending.remove(&mid);
            log::warn!("Timed out waiting for MID {:#06x}.", mid);
            return Err(crate::Error::Timeout(self.config.timeout));
        };
        let frame = match self.transport.receive_frame(Some(remaining)) {
            Ok(frame) => frame,
            Err(crate::Error::Timeout(_)) => {
                self.pending.remove(&mid);
                log::warn!("Timed out waiting for MID {:#06x}.", mid);
                return Err(crate::Error::Timeout(self.config.timeout));
            }
            Err(e) => {
                self.teardown();
                return Err(e);
            }
        };
        self.dispatch(frame)
    }

    /// Parses one incoming frame and routes it. Malformed packets and
    /// unknown MIDs are logged and dropped; only connection-fatal problems
    /// surface as errors.
    fn dispatch(&mut self, frame: Vec<u8>) -> crate::Result<()> {
        let packet = match ReceivedPacket::parse(frame) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Discarding malformed packet: {}.", e);
                return Ok(());
            }
        };
        let mid = packet.header.mid;

        // Server-initiated oplock break: reserved MID, a LockingX that is
        // not a reply to anything of ours.
        if mid == MID_RESERVED
            && packet.header.command == Command::LockingX
            && !packet.header.flags.reply()
        {
            log::debug!("Oplock break notification received.");
            if let Some(handler) = self.oplock_handler.as_mut() {
                handler(&packet);
            }
            return Ok(());
        }

        let expected_seq = self.pending.get(&mid).and_then(|slot| slot.reply_seq);
        if let Err(e) = self.signing.verify(packet.bytes(), expected_seq) {
            log::error!("Tearing down connection: {}.", e);
            self.teardown();
            return Err(e);
        }

        let Some(slot) = self.pending.get_mut(&mid) else {
            log::debug!(
                "Discarding reply with unknown MID {:#06x} ({}).",
                mid,
                packet.header.command
            );
            return Ok(());
        };

        if packet.header.command != slot.command {
            slot.state =
                SlotState::Failed(crate::Error::UnexpectedCommand(packet.header.command as u8));
            return Ok(());
        }

        let status = packet.header.status;
        if status == Status::U32_CANCELLED {
            slot.state = SlotState::Failed(crate::Error::OperationCanceled);
            return Ok(());
        }

        let state = std::mem::replace(&mut slot.state, SlotState::Waiting);
        slot.state = match state {
            SlotState::Waiting => SlotState::Ready(Completion::Packet(packet)),
            SlotState::Reassembling(mut asm) => {
                // Overflow marks a fragment that was truncated to fit the
                // negotiated buffer; the stream continues.
                if status != Status::U32_SUCCESS && status != Status::U32_BUFFER_OVERFLOW {
                    SlotState::Failed(crate::Error::ErrorStatus(status))
                } else {
                    match asm.feed(&packet) {
                        Ok(true) => SlotState::Ready(Completion::Trans(asm.into_reply())),
                        Ok(false) => SlotState::Reassembling(asm),
                        Err(e) => SlotState::Failed(e),
                    }
                }
            }
            done => {
                log::debug!("Discarding duplicate reply for MID {:#06x}.", mid);
                done
            }
        };
        Ok(())
    }

    fn teardown(&mut self) {
        self.dead = true;
        self.pending.clear();
        self.signing.disable();
    }

    /// Runs a complete transaction: fragments the request against the
    /// negotiated buffer size, waits for the interim acknowledgment before
    /// sending secondaries, and reassembles the reply fragments.
    pub fn transact(
        &mut self,
        session: &Session,
        tree: &Tree,
        req: &TransRequest<'_>,
    ) -> crate::Result<TransReply> {
        let family = req.family;
        let total_param = req.params.len() as u32;
        let total_data = req.data.len() as u32;

        let mut request = self.setup(
            session,
            tree,
            family.primary_command(),
            family.primary_word_count(req.setup.len()),
            0,
        )?;
        match family {
            TransFamily::Trans => {
                request.append_string(req.name, WireStr::Ascii)?;
            }
            TransFamily::Trans2 => {
                // Dummy transaction name, kept for wire compatibility.
                request.append_bytes(&[0, b'D', b' '])?;
            }
            TransFamily::NtTrans => {}
        }

        let mut sent_param = 0usize;
        let mut sent_data = 0usize;
        let room = self.room_after(request.len());
        let this_param = req.params.len().min(room);
        let param_offset = request.append_bytes(&req.params[..this_param])? as u32;
        let room = self.room_after(request.len());
        let this_data = req.data.len().min(room);
        let data_offset = request.append_bytes(&req.data[..this_data])? as u32;
        sent_param += this_param;
        sent_data += this_data;

        let fields = PrimaryFields {
            total_param,
            total_data,
            max_param: req.max_param,
            max_data: req.max_data,
            max_setup: req.max_setup,
            flags: req.flags,
            timeout: req.timeout_ms,
            function: req.function,
            this_param: this_param as u32,
            param_offset,
            this_data: this_data as u32,
            data_offset,
        };
        {
            let buf = request.buf_mut();
            write_primary(buf, family, &fields, req.setup)?;
        }

        let mid = self.send(request)?;
        log::debug!(
            "{} primary sent ({}/{} param, {}/{} data bytes).",
            family,
            sent_param,
            total_param,
            sent_data,
            total_data
        );

        if sent_param < req.params.len() || sent_data < req.data.len() {
            self.wait_interim(mid)?;
            while sent_param < req.params.len() || sent_data < req.data.len() {
                self.send_secondary(
                    session,
                    tree,
                    mid,
                    req,
                    total_param,
                    total_data,
                    &mut sent_param,
                    &mut sent_data,
                )?;
            }
        }

        match self.wait_slot(mid)? {
            Completion::Trans(reply) => Ok(reply),
            Completion::Packet(_) => Err(crate::Error::InvalidState(
                "Transaction slot completed without reassembly".into(),
            )),
        }
    }

    fn room_after(&self, len: usize) -> usize {
        (self.config.max_xmit as usize).saturating_sub(len)
    }

    /// Spins the dispatch loop until the interim acknowledgment (or the
    /// whole reply, for servers that skip the interim) arrives for `mid`.
    fn wait_interim(&mut self, mid: u16) -> crate::Result<()> {
        loop {
            match self.pending.get(&mid) {
                None => {
                    return Err(if self.dead {
                        crate::Error::TransportClosed
                    } else {
                        crate::Error::CorrelationNotFound(mid)
                    })
                }
                Some(slot) => match &slot.state {
                    SlotState::Reassembling(asm) if asm.interim_seen() => return Ok(()),
                    SlotState::Ready(_) | SlotState::Failed(_) => return Ok(()),
                    _ => {}
                },
            }
            self.pump(mid)?;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn send_secondary(
        &mut self,
        session: &Session,
        tree: &Tree,
        mid: u16,
        req: &TransRequest<'_>,
        total_param: u32,
        total_data: u32,
        sent_param: &mut usize,
        sent_data: &mut usize,
    ) -> crate::Result<()> {
        let family = req.family;
        let mut buf = self.build(
            session,
            tree,
            family.secondary_command(),
            family.secondary_word_count(),
            0,
            mid,
        )?;

        let room = self.room_after(buf.len());
        let this_param = (req.params.len() - *sent_param).min(room);
        let param_offset = buf.append_bytes(&req.params[*sent_param..*sent_param + this_param])?;
        let room = self.room_after(buf.len());
        let this_data = (req.data.len() - *sent_data).min(room);
        let data_offset = buf.append_bytes(&req.data[*sent_data..*sent_data + this_data])?;

        let fields = SecondaryFields {
            total_param,
            total_data,
            this_param: this_param as u32,
            param_offset: if this_param > 0 { param_offset as u32 } else { 0 },
            param_disp: *sent_param as u32,
            this_data: this_data as u32,
            data_offset: if this_data > 0 { data_offset as u32 } else { 0 },
            data_disp: *sent_data as u32,
            fid: 0,
        };
        write_secondary(&mut buf, family, &fields)?;

        let reply_seq = self.sign_and_send(buf.into_bytes(), false)?;
        if let Some(slot) = self.pending.get_mut(&mid) {
            // Reply fragments are verified against the sequence reserved by
            // the most recent packet of the transaction.
            slot.reply_seq = reply_seq;
        }
        *sent_param += this_param;
        *sent_data += this_data;
        log::trace!(
            "{} secondary sent ({}/{} param, {}/{} data bytes).",
            family,
            sent_param,
            total_param,
            sent_data,
            total_data
        );
        Ok(())
    }
}
