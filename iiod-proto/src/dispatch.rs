//! Command dispatch.
//!
//! Implements the responder's command callback for a [`Session`]:
//! resolves device / attribute handles against the context, delegates to
//! the buffer multiplexer and the event stream forwarder, and maps every
//! failure to the negative errno the client sees.
//!
//! Handlers that enqueue background work (block transfers, blocking
//! event reads) send no response here; the task worker completes the
//! record's own handle. Every other handler responds before returning.

use std::sync::Arc;

use bytes::Bytes;
use smallvec::{smallvec, SmallVec};
use tracing::debug;

use iiod_core::backend::{AttrSource, IioDevice};
use iiod_core::error::{IiodError, Result};
use iiod_core::mask::ChannelMask;

use crate::buffer::{BufferEntry, BufferKey};
use crate::evstream::EvStreamEntry;
use crate::responder::{CommandData, CommandHandler, Responder};
use crate::session::Session;
use crate::wire::{Command, Opcode};

/// Scratch size for attribute reads and the cap for attribute writes.
const ATTR_SCRATCH_SIZE: usize = 64 * 1024;

impl CommandHandler for Session {
    fn handle_command(&self, responder: &Responder, cmd: &Command, data: &mut CommandData<'_>) {
        let Some(op) = cmd.opcode() else {
            debug!(op = cmd.op, "unknown opcode");
            let _ = responder
                .transient_io(cmd.client_id)
                .send_response_code(-libc::EINVAL);
            return;
        };

        let res = match op {
            Opcode::Print => self.op_print(responder, cmd),
            Opcode::Timeout => self.op_timeout(responder, cmd),

            Opcode::ReadAttr => self.op_read_attr(responder, cmd, AttrSource::Device),
            Opcode::ReadDbgAttr => self.op_read_attr(responder, cmd, AttrSource::Debug),
            Opcode::ReadBufAttr => {
                self.op_read_attr(responder, cmd, AttrSource::Buffer(cmd.target_idx()))
            }
            Opcode::ReadChnAttr => {
                self.op_read_attr(responder, cmd, AttrSource::Channel(cmd.target_idx()))
            }
            Opcode::WriteAttr => self.op_write_attr(responder, cmd, data, AttrSource::Device),
            Opcode::WriteDbgAttr => self.op_write_attr(responder, cmd, data, AttrSource::Debug),
            Opcode::WriteBufAttr => {
                self.op_write_attr(responder, cmd, data, AttrSource::Buffer(cmd.target_idx()))
            }
            Opcode::WriteChnAttr => {
                self.op_write_attr(responder, cmd, data, AttrSource::Channel(cmd.target_idx()))
            }
            Opcode::GetTrig => self.op_get_trig(responder, cmd),
            Opcode::SetTrig => self.op_set_trig(responder, cmd),

            Opcode::CreateBuffer => self.op_create_buffer(responder, cmd, data),
            Opcode::FreeBuffer => self.op_free_buffer(responder, cmd),
            Opcode::EnableBuffer => self.op_enable_buffer(responder, cmd),
            Opcode::DisableBuffer => self.op_disable_buffer(responder, cmd),

            Opcode::CreateBlock => self.op_create_block(responder, cmd, data),
            Opcode::FreeBlock => self.op_free_block(responder, cmd),
            Opcode::TransferBlock => self.op_transfer(responder, cmd, data, false),
            Opcode::EnqueueBlockCyclic => self.op_transfer(responder, cmd, data, true),

            Opcode::CreateEvstream => self.op_create_evstream(responder, cmd),
            Opcode::FreeEvstream => self.op_free_evstream(responder, cmd),
            Opcode::ReadEvent => self.op_read_event(cmd),
        };

        if let Err(e) = res {
            debug!(op = ?op, client_id = cmd.client_id, err = %e, "command failed");
            // Transport-eof means there is nobody left to answer.
            if !e.is_fatal() {
                let _ = responder
                    .transient_io(cmd.client_id)
                    .send_response_code(e.errno());
            }
        }
    }
}

impl Session {
    fn device(&self, dev_idx: u16) -> Result<Arc<dyn IioDevice>> {
        self.ctx()
            .device(dev_idx as usize)
            .ok_or(IiodError::BadHandle)
    }

    fn buffer(&self, key: BufferKey) -> Result<Arc<BufferEntry>> {
        let entry = self.registries().buffers.get(key).ok_or(IiodError::BadHandle)?;
        if !entry.is_member(self.id()) {
            return Err(IiodError::BadHandle);
        }
        Ok(entry)
    }

    fn op_print(&self, responder: &Responder, cmd: &Command) -> Result<()> {
        let desc = self.ctx().description();
        let payload: SmallVec<[Bytes; 1]> = smallvec![desc];
        responder
            .transient_io(cmd.client_id)
            .send_response(payload[0].len() as i32, &payload)
    }

    fn op_timeout(&self, responder: &Responder, cmd: &Command) -> Result<()> {
        if cmd.code < 0 {
            return Err(IiodError::InvalidArg);
        }
        self.ctx().set_timeout(cmd.code as u32)?;
        responder.transient_io(cmd.client_id).send_response_code(0)
    }

    fn op_read_attr(&self, responder: &Responder, cmd: &Command, src: AttrSource) -> Result<()> {
        let dev = self.device(cmd.dev_idx)?;
        let mut scratch = vec![0u8; ATTR_SCRATCH_SIZE];
        let n = dev.read_attr(src, cmd.attr_idx(), &mut scratch)?;
        scratch.truncate(n);
        let payload: SmallVec<[Bytes; 1]> = smallvec![Bytes::from(scratch)];
        responder
            .transient_io(cmd.client_id)
            .send_response(n as i32, &payload)
    }

    fn op_write_attr(
        &self,
        responder: &Responder,
        cmd: &Command,
        data: &mut CommandData<'_>,
        src: AttrSource,
    ) -> Result<()> {
        let len = data.read_u64()? as usize;
        if len > ATTR_SCRATCH_SIZE {
            data.discard(len)?;
            return Err(IiodError::InvalidArg);
        }
        let mut value = vec![0u8; len];
        data.read_exact(&mut value)?;

        // Resolution happens after the payload is consumed so a failed
        // lookup cannot desynchronize the stream.
        let dev = self.device(cmd.dev_idx)?;
        let n = dev.write_attr(src, cmd.attr_idx(), &value)?;
        responder
            .transient_io(cmd.client_id)
            .send_response_code(n as i32)
    }

    fn op_get_trig(&self, responder: &Responder, cmd: &Command) -> Result<()> {
        let dev = self.device(cmd.dev_idx)?;
        match dev.trigger()? {
            Some(idx) => responder
                .transient_io(cmd.client_id)
                .send_response_code(idx as i32),
            None => Err(IiodError::NotFound),
        }
    }

    fn op_set_trig(&self, responder: &Responder, cmd: &Command) -> Result<()> {
        let dev = self.device(cmd.dev_idx)?;
        if cmd.code < 0 {
            dev.set_trigger(None)?;
        } else {
            let trig = cmd.code as usize;
            if self.ctx().device(trig).is_none() {
                return Err(IiodError::NotFound);
            }
            dev.set_trigger(Some(trig))?;
        }
        responder.transient_io(cmd.client_id).send_response_code(0)
    }

    fn op_create_buffer(
        &self,
        responder: &Responder,
        cmd: &Command,
        data: &mut CommandData<'_>,
    ) -> Result<()> {
        let dev = self.device(cmd.dev_idx)?;
        let mut raw_mask = vec![0u8; ChannelMask::wire_size(dev.nb_channels())];
        data.read_exact(&mut raw_mask)?;

        // The registry either creates the kernel buffer or joins this
        // session onto the existing record, unioning the mask in.
        let key = (cmd.dev_idx, cmd.buf_idx());
        let wire_mask = self.registries().buffers.create_or_join(
            key,
            self.id(),
            &dev,
            &raw_mask,
            cmd.cyclic_flag(),
            self.options().demux,
        )?;
        self.adopt_buffer(key);

        let payload: SmallVec<[Bytes; 1]> = smallvec![wire_mask];
        responder
            .transient_io(cmd.client_id)
            .send_response(payload[0].len() as i32, &payload)
    }

    fn op_free_buffer(&self, responder: &Responder, cmd: &Command) -> Result<()> {
        let key = (cmd.dev_idx, cmd.buf_idx());
        self.registries().buffers.leave(key, self.id(), responder)?;
        self.disown_buffer(key);
        responder.transient_io(cmd.client_id).send_response_code(0)
    }

    fn op_enable_buffer(&self, responder: &Responder, cmd: &Command) -> Result<()> {
        let entry = self.buffer((cmd.dev_idx, cmd.buf_idx()))?;
        entry.enable(self.pool(), self.id())?;
        responder.transient_io(cmd.client_id).send_response_code(0)
    }

    fn op_disable_buffer(&self, responder: &Responder, cmd: &Command) -> Result<()> {
        let entry = self.buffer((cmd.dev_idx, cmd.buf_idx()))?;
        entry.disable(self.id())?;
        responder.transient_io(cmd.client_id).send_response_code(0)
    }

    fn op_create_block(
        &self,
        responder: &Responder,
        cmd: &Command,
        data: &mut CommandData<'_>,
    ) -> Result<()> {
        let size = data.read_u64()?;
        if size == 0 || size > u64::try_from(usize::MAX).unwrap_or(u64::MAX) {
            return Err(IiodError::InvalidArg);
        }
        let entry = self.buffer((cmd.dev_idx, cmd.buf_idx()))?;
        entry.create_block(responder, self.id(), cmd.client_id, size as usize)?;
        responder.transient_io(cmd.client_id).send_response_code(0)
    }

    fn op_free_block(&self, responder: &Responder, cmd: &Command) -> Result<()> {
        let entry = self.buffer((cmd.dev_idx, cmd.buf_idx()))?;
        entry.free_block(responder, self.id(), cmd.client_id)?;
        responder.transient_io(cmd.client_id).send_response_code(0)
    }

    fn op_transfer(
        &self,
        _responder: &Responder,
        cmd: &Command,
        data: &mut CommandData<'_>,
        cyclic: bool,
    ) -> Result<()> {
        let bytes_used = data.read_u64()?;
        let entry = self.buffer((cmd.dev_idx, cmd.buf_idx()))?;
        // The completion travels on the block's own handle.
        entry.transfer(self.id(), cmd.client_id, bytes_used, cyclic, data)
    }

    fn op_create_evstream(&self, responder: &Responder, cmd: &Command) -> Result<()> {
        let dev = self.device(cmd.dev_idx)?;
        let key = (cmd.dev_idx, cmd.client_id);
        let entry = EvStreamEntry::create(key, self.id(), &dev, responder, self.pool())?;
        if let Err(e) = self.registries().evstreams.insert(Arc::clone(&entry)) {
            entry.free(responder);
            return Err(e);
        }
        self.adopt_evstream(key);
        responder.transient_io(cmd.client_id).send_response_code(0)
    }

    fn op_free_evstream(&self, responder: &Responder, cmd: &Command) -> Result<()> {
        let key = (cmd.dev_idx, (cmd.code & 0xffff) as u16);
        let entry = self.registries().evstreams.get(key).ok_or(IiodError::BadHandle)?;
        if entry.owner() != self.id() {
            return Err(IiodError::BadHandle);
        }
        let entry = self.registries().evstreams.remove(key).ok_or(IiodError::BadHandle)?;
        self.disown_evstream(key);
        entry.free(responder);
        responder.transient_io(cmd.client_id).send_response_code(0)
    }

    fn op_read_event(&self, cmd: &Command) -> Result<()> {
        let key = (cmd.dev_idx, cmd.client_id);
        let entry = self.registries().evstreams.get(key).ok_or(IiodError::BadHandle)?;
        if entry.owner() != self.id() {
            return Err(IiodError::BadHandle);
        }
        entry.read_event(cmd.code & 1 != 0)
    }
}
