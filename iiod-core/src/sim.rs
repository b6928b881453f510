//! Simulated IIO context.
//!
//! A software implementation of the [`backend`](crate::backend) contract,
//! standing in for the kernel access layer the way an in-process transport
//! stands in for a real carrier. Used by the daemon when no hardware is
//! present and by the integration tests.
//!
//! Behavior:
//! - RX blocks are filled with a deterministic ramp pattern on dequeue
//! - TX payloads are appended to a per-device sink for inspection
//! - Event streams drain an injectable queue ([`SimDevice::push_event`])
//! - `dequeue` fails once the buffer is disabled or cancelled
//! - With [`SimDevice::pace_rx`], dequeues wait for [`SimDevice::feed`]
//!   credits, which makes cancellation of an in-flight transfer testable

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::backend::{
    AttrSource, IioBlock, IioBuffer, IioContext, IioDevice, IioEvent, IioEventStream,
};
use crate::error::{IiodError, Result};
use crate::mask::ChannelMask;

struct SimAttr {
    name: String,
    value: Mutex<String>,
}

impl SimAttr {
    fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: Mutex::new(value.to_string()),
        }
    }
}

/// One scan channel of a simulated device.
pub struct SimChannel {
    id: String,
    sample_size: usize,
    attrs: Vec<SimAttr>,
}

/// Credit gate pacing RX dequeues when enabled.
struct RxGate {
    credits: Mutex<u64>,
    cond: Condvar,
}

/// A simulated IIO device.
pub struct SimDevice {
    id: String,
    index: usize,
    is_output: bool,
    channels: Vec<SimChannel>,
    dev_attrs: Vec<SimAttr>,
    dbg_attrs: Vec<SimAttr>,
    buf_attrs: Vec<SimAttr>,
    trigger: Mutex<Option<usize>>,
    forced_channels: Vec<usize>,
    paced_rx: AtomicBool,
    gate: Arc<RxGate>,
    tx_sink: Arc<Mutex<Vec<u8>>>,
    events_tx: flume::Sender<IioEvent>,
    events_rx: flume::Receiver<IioEvent>,
}

impl SimDevice {
    /// New device; `is_output` selects the buffer direction.
    #[must_use]
    pub fn new(id: &str, index: usize, is_output: bool) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            id: id.to_string(),
            index,
            is_output,
            channels: Vec::new(),
            dev_attrs: Vec::new(),
            dbg_attrs: Vec::new(),
            buf_attrs: Vec::new(),
            trigger: Mutex::new(None),
            forced_channels: Vec::new(),
            paced_rx: AtomicBool::new(false),
            gate: Arc::new(RxGate {
                credits: Mutex::new(0),
                cond: Condvar::new(),
            }),
            tx_sink: Arc::new(Mutex::new(Vec::new())),
            events_tx,
            events_rx,
        }
    }

    /// Append a scan channel.
    pub fn add_channel(&mut self, id: &str, sample_size: usize) -> &mut Self {
        self.channels.push(SimChannel {
            id: id.to_string(),
            sample_size,
            attrs: Vec::new(),
        });
        self
    }

    /// Append an attribute to the given namespace (for `Channel(n)`, to
    /// channel `n`).
    pub fn add_attr(&mut self, src: AttrSource, name: &str, value: &str) -> &mut Self {
        let attr = SimAttr::new(name, value);
        match src {
            AttrSource::Device => self.dev_attrs.push(attr),
            AttrSource::Debug => self.dbg_attrs.push(attr),
            AttrSource::Buffer(_) => self.buf_attrs.push(attr),
            AttrSource::Channel(chn) => self.channels[chn as usize].attrs.push(attr),
        }
        self
    }

    /// Declare channels the kernel enables no matter what the client asked
    /// for (mask reconciliation).
    pub fn force_channels(&mut self, channels: &[usize]) -> &mut Self {
        self.forced_channels = channels.to_vec();
        self
    }

    /// Make RX dequeues wait for [`feed`](Self::feed) credits instead of
    /// completing immediately.
    pub fn pace_rx(&self) {
        self.paced_rx.store(true, Ordering::SeqCst);
    }

    /// Grant `n` dequeue credits to paced RX buffers.
    pub fn feed(&self, n: u64) {
        let mut credits = self.gate.credits.lock();
        *credits += n;
        self.gate.cond.notify_all();
    }

    /// Inject a hardware event.
    pub fn push_event(&self, event: IioEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Everything written through TX buffers so far.
    #[must_use]
    pub fn tx_data(&self) -> Vec<u8> {
        self.tx_sink.lock().clone()
    }

    /// Channel identifier (XML layer, logging).
    #[must_use]
    pub fn channel_id(&self, chn: usize) -> Option<&str> {
        self.channels.get(chn).map(|c| c.id.as_str())
    }

    /// Attribute name by namespace and index (XML layer, logging).
    #[must_use]
    pub fn attr_name(&self, src: AttrSource, idx: u16) -> Option<&str> {
        self.attrs(src)
            .ok()?
            .get(idx as usize)
            .map(|a| a.name.as_str())
    }

    fn attrs(&self, src: AttrSource) -> Result<&[SimAttr]> {
        match src {
            AttrSource::Device => Ok(&self.dev_attrs),
            AttrSource::Debug => Ok(&self.dbg_attrs),
            AttrSource::Buffer(_) => Ok(&self.buf_attrs),
            AttrSource::Channel(chn) => self
                .channels
                .get(chn as usize)
                .map(|c| c.attrs.as_slice())
                .ok_or(IiodError::BadHandle),
        }
    }

    fn attr(&self, src: AttrSource, idx: u16) -> Result<&SimAttr> {
        self.attrs(src)?.get(idx as usize).ok_or(IiodError::NotFound)
    }
}

impl IioDevice for SimDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn index(&self) -> usize {
        self.index
    }

    fn is_output(&self) -> bool {
        self.is_output
    }

    fn nb_channels(&self) -> usize {
        self.channels.len()
    }

    fn sample_size(&self, chn: usize) -> Result<usize> {
        self.channels
            .get(chn)
            .map(|c| c.sample_size)
            .ok_or(IiodError::BadHandle)
    }

    fn nb_attrs(&self, src: AttrSource) -> usize {
        self.attrs(src).map_or(0, <[SimAttr]>::len)
    }

    fn read_attr(&self, src: AttrSource, idx: u16, dst: &mut [u8]) -> Result<usize> {
        let value = self.attr(src, idx)?.value.lock();
        let bytes = value.as_bytes();
        let n = bytes.len().min(dst.len());
        dst[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn write_attr(&self, src: AttrSource, idx: u16, data: &[u8]) -> Result<usize> {
        let attr = self.attr(src, idx)?;
        *attr.value.lock() = String::from_utf8_lossy(data).into_owned();
        Ok(data.len())
    }

    fn trigger(&self) -> Result<Option<usize>> {
        Ok(*self.trigger.lock())
    }

    fn set_trigger(&self, trigger: Option<usize>) -> Result<()> {
        *self.trigger.lock() = trigger;
        Ok(())
    }

    fn create_buffer(&self, _idx: u16, mask: &mut ChannelMask) -> Result<Arc<dyn IioBuffer>> {
        if mask.nb_channels() != self.channels.len() {
            return Err(IiodError::InvalidArg);
        }
        if mask.is_empty() {
            return Err(IiodError::InvalidArg);
        }
        for &chn in &self.forced_channels {
            mask.set(chn);
        }
        Ok(Arc::new(SimBuffer {
            is_output: self.is_output,
            paced_rx: self.paced_rx.load(Ordering::SeqCst),
            gate: Arc::clone(&self.gate),
            tx_sink: Arc::clone(&self.tx_sink),
            shared: Arc::new(BufShared {
                state: Mutex::new(BufState {
                    enabled: false,
                    cancelled: false,
                }),
            }),
            seq: Arc::new(AtomicU64::new(0)),
        }))
    }

    fn create_event_stream(&self) -> Result<Arc<dyn IioEventStream>> {
        let (cancel_tx, cancel_rx) = flume::bounded(1);
        Ok(Arc::new(SimEventStream {
            events: self.events_rx.clone(),
            cancel_tx,
            cancel_rx,
            cancelled: AtomicBool::new(false),
        }))
    }
}

struct BufState {
    enabled: bool,
    cancelled: bool,
}

struct BufShared {
    state: Mutex<BufState>,
}

struct SimBuffer {
    is_output: bool,
    paced_rx: bool,
    gate: Arc<RxGate>,
    tx_sink: Arc<Mutex<Vec<u8>>>,
    shared: Arc<BufShared>,
    // Shared by all blocks of the buffer so consecutive dequeues produce a
    // continuous ramp.
    seq: Arc<AtomicU64>,
}

impl IioBuffer for SimBuffer {
    fn enable(&self) -> Result<()> {
        let mut st = self.shared.state.lock();
        if st.cancelled {
            return Err(IiodError::Cancelled);
        }
        st.enabled = true;
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        self.shared.state.lock().enabled = false;
        self.gate.cond.notify_all();
        Ok(())
    }

    fn cancel(&self) {
        self.shared.state.lock().cancelled = true;
        self.gate.cond.notify_all();
    }

    fn create_block(&self, size: usize) -> Result<Box<dyn IioBlock>> {
        if size == 0 {
            return Err(IiodError::InvalidArg);
        }
        Ok(Box::new(SimBlock {
            data: vec![0; size],
            queued: None,
            buffer: SimBufferRef {
                is_output: self.is_output,
                paced_rx: self.paced_rx,
                gate: Arc::clone(&self.gate),
                tx_sink: Arc::clone(&self.tx_sink),
                shared: Arc::clone(&self.shared),
            },
            seq: Arc::clone(&self.seq),
        }))
    }
}

struct SimBufferRef {
    is_output: bool,
    paced_rx: bool,
    gate: Arc<RxGate>,
    tx_sink: Arc<Mutex<Vec<u8>>>,
    shared: Arc<BufShared>,
}

struct SimBlock {
    data: Vec<u8>,
    queued: Option<(usize, bool)>,
    buffer: SimBufferRef,
    seq: Arc<AtomicU64>,
}

impl IioBlock for SimBlock {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn data(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn enqueue(&mut self, bytes_used: usize, cyclic: bool) -> Result<()> {
        if bytes_used == 0 || bytes_used > self.data.len() {
            return Err(IiodError::InvalidArg);
        }
        {
            let st = self.buffer.shared.state.lock();
            if st.cancelled {
                return Err(IiodError::Cancelled);
            }
        }
        if self.buffer.is_output {
            self.buffer
                .tx_sink
                .lock()
                .extend_from_slice(&self.data[..bytes_used]);
        }
        self.queued = Some((bytes_used, cyclic));
        Ok(())
    }

    fn dequeue(&mut self) -> Result<usize> {
        let (bytes_used, _cyclic) = self.queued.take().ok_or(IiodError::InvalidArg)?;

        loop {
            {
                let st = self.buffer.shared.state.lock();
                if st.cancelled {
                    return Err(IiodError::Cancelled);
                }
                if !st.enabled {
                    return Err(IiodError::Errno(-libc::EBADF));
                }
            }
            if self.buffer.is_output || !self.buffer.paced_rx {
                break;
            }
            let mut credits = self.buffer.gate.credits.lock();
            if *credits > 0 {
                *credits -= 1;
                break;
            }
            // Timed wait: state changes (cancel/disable) are re-checked at
            // the top of the loop even if the notification raced the wait.
            self.buffer
                .gate
                .cond
                .wait_for(&mut credits, std::time::Duration::from_millis(10));
        }

        if !self.buffer.is_output {
            let base = self.seq.fetch_add(bytes_used as u64, Ordering::SeqCst);
            for (i, byte) in self.data[..bytes_used].iter_mut().enumerate() {
                *byte = (base.wrapping_add(i as u64) & 0xff) as u8;
            }
        }
        Ok(bytes_used)
    }
}

struct SimEventStream {
    events: flume::Receiver<IioEvent>,
    cancel_tx: flume::Sender<()>,
    cancel_rx: flume::Receiver<()>,
    cancelled: AtomicBool,
}

impl IioEventStream for SimEventStream {
    fn read_event(&self, nonblock: bool) -> Result<IioEvent> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(IiodError::Cancelled);
        }
        if nonblock {
            return match self.events.try_recv() {
                Ok(ev) => Ok(ev),
                Err(flume::TryRecvError::Empty) => Err(IiodError::WouldBlock),
                Err(flume::TryRecvError::Disconnected) => Err(IiodError::Closed),
            };
        }

        enum Wake {
            Event(std::result::Result<IioEvent, flume::RecvError>),
            Cancel,
        }
        let wake = flume::Selector::new()
            .recv(&self.events, Wake::Event)
            .recv(&self.cancel_rx, |_| Wake::Cancel)
            .wait();
        match wake {
            Wake::Event(Ok(ev)) => Ok(ev),
            Wake::Event(Err(_)) => Err(IiodError::Closed),
            Wake::Cancel => Err(IiodError::Cancelled),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.cancel_tx.try_send(());
    }
}

/// A simulated IIO context.
pub struct SimContext {
    name: String,
    description: Bytes,
    devices: Vec<Arc<SimDevice>>,
    timeout_ms: AtomicU32,
}

impl SimContext {
    /// Build a context over the given devices. `description` stands in for
    /// the serialized, compressed context blob produced outside the core.
    #[must_use]
    pub fn new(name: &str, description: Bytes, devices: Vec<Arc<SimDevice>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            description,
            devices,
            timeout_ms: AtomicU32::new(0),
        })
    }

    /// Current kernel-side timeout (0 = default).
    #[must_use]
    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms.load(Ordering::SeqCst)
    }

    /// Typed access to a device (tests).
    #[must_use]
    pub fn sim_device(&self, idx: usize) -> Option<Arc<SimDevice>> {
        self.devices.get(idx).cloned()
    }
}

impl IioContext for SimContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Bytes {
        self.description.clone()
    }

    fn nb_devices(&self) -> usize {
        self.devices.len()
    }

    fn device(&self, idx: usize) -> Option<Arc<dyn IioDevice>> {
        self.devices
            .get(idx)
            .map(|d| Arc::clone(d) as Arc<dyn IioDevice>)
    }

    fn set_timeout(&self, timeout_ms: u32) -> Result<()> {
        self.timeout_ms.store(timeout_ms, Ordering::SeqCst);
        Ok(())
    }
}

/// A ready-made two-device context: one 4-channel ADC (RX) and one
/// 2-channel DAC (TX), with attributes in every namespace.
#[must_use]
pub fn demo_context() -> Arc<SimContext> {
    let mut adc = SimDevice::new("iio:device0", 0, false);
    adc.add_channel("voltage0", 2)
        .add_channel("voltage1", 2)
        .add_channel("voltage2", 2)
        .add_channel("voltage3", 2)
        .add_attr(AttrSource::Device, "sampling_frequency", "1000")
        .add_attr(AttrSource::Device, "scale", "0.030518")
        .add_attr(AttrSource::Device, "calib_mode", "auto")
        .add_attr(AttrSource::Debug, "direct_reg_access", "0x00")
        .add_attr(AttrSource::Buffer(0), "length_align_bytes", "8")
        .add_attr(AttrSource::Channel(0), "raw", "512")
        .add_attr(AttrSource::Channel(0), "offset", "0")
        .add_attr(AttrSource::Channel(1), "raw", "100");

    let mut dac = SimDevice::new("iio:device1", 1, true);
    dac.add_channel("altvoltage0", 2)
        .add_channel("altvoltage1", 2)
        .add_attr(AttrSource::Device, "sampling_frequency", "48000");

    let mut trig = SimDevice::new("trigger0", 2, false);
    trig.add_attr(AttrSource::Device, "frequency", "100");

    let description = Bytes::from_static(b"<iiod-context name=\"sim\" devices=\"3\"/>");
    SimContext::new(
        "sim",
        description,
        vec![Arc::new(adc), Arc::new(dac), Arc::new(trig)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_round_trip() {
        let ctx = demo_context();
        let dev = ctx.device(0).unwrap();

        let mut buf = [0u8; 64];
        let n = dev.read_attr(AttrSource::Device, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"1000");

        dev.write_attr(AttrSource::Device, 0, b"2500").unwrap();
        let n = dev.read_attr(AttrSource::Device, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"2500");
    }

    #[test]
    fn test_unknown_attr_is_not_found() {
        let ctx = demo_context();
        let dev = ctx.device(1).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            dev.read_attr(AttrSource::Device, 99, &mut buf),
            Err(IiodError::NotFound)
        ));
        assert!(matches!(
            dev.read_attr(AttrSource::Channel(7), 0, &mut buf),
            Err(IiodError::BadHandle)
        ));
    }

    #[test]
    fn test_mask_reconciliation_forces_channels() {
        let mut dev = SimDevice::new("adc", 0, false);
        dev.add_channel("a", 2).add_channel("b", 2).add_channel("c", 2);
        dev.force_channels(&[2]);

        let mut mask = ChannelMask::new(3);
        mask.set(0);
        dev.create_buffer(0, &mut mask).unwrap();
        assert!(mask.test(0));
        assert!(mask.test(2));
        assert!(!mask.test(1));

        // Round-trip stability: honoring an already-honored mask is a no-op.
        let mut again = mask.clone();
        dev.create_buffer(0, &mut again).unwrap();
        assert_eq!(again, mask);
    }

    #[test]
    fn test_empty_mask_rejected() {
        let ctx = demo_context();
        let dev = ctx.device(0).unwrap();
        let mut mask = ChannelMask::new(4);
        assert!(matches!(
            dev.create_buffer(0, &mut mask),
            Err(IiodError::InvalidArg)
        ));
    }

    #[test]
    fn test_rx_block_ramp() {
        let ctx = demo_context();
        let dev = ctx.device(0).unwrap();
        let mut mask = ChannelMask::new(4);
        mask.set(0);
        let buf = dev.create_buffer(0, &mut mask).unwrap();
        buf.enable().unwrap();

        let mut block = buf.create_block(8).unwrap();
        block.enqueue(8, false).unwrap();
        assert_eq!(block.dequeue().unwrap(), 8);
        assert_eq!(block.data(), &[0, 1, 2, 3, 4, 5, 6, 7]);

        block.enqueue(4, false).unwrap();
        block.dequeue().unwrap();
        assert_eq!(&block.data()[..4], &[8, 9, 10, 11]);
    }

    #[test]
    fn test_tx_block_lands_in_sink() {
        let ctx = demo_context();
        let sim_dev = ctx.sim_device(1).unwrap();
        let dev = ctx.device(1).unwrap();
        let mut mask = ChannelMask::new(2);
        mask.set(0);
        let buf = dev.create_buffer(0, &mut mask).unwrap();
        buf.enable().unwrap();

        let mut block = buf.create_block(4).unwrap();
        block.data().copy_from_slice(b"\x01\x02\x03\x04");
        block.enqueue(4, false).unwrap();
        assert_eq!(block.dequeue().unwrap(), 4);
        assert_eq!(sim_dev.tx_data(), b"\x01\x02\x03\x04");
    }

    #[test]
    fn test_dequeue_fails_after_cancel() {
        let ctx = demo_context();
        let dev = ctx.device(0).unwrap();
        let mut mask = ChannelMask::new(4);
        mask.set(0);
        let buf = dev.create_buffer(0, &mut mask).unwrap();
        buf.enable().unwrap();

        let mut block = buf.create_block(16).unwrap();
        block.enqueue(16, false).unwrap();
        buf.cancel();
        assert!(matches!(block.dequeue(), Err(IiodError::Cancelled)));
    }

    #[test]
    fn test_paced_dequeue_unblocks_on_cancel() {
        let ctx = demo_context();
        let sim_dev = ctx.sim_device(0).unwrap();
        sim_dev.pace_rx();
        let dev = ctx.device(0).unwrap();
        let mut mask = ChannelMask::new(4);
        mask.set(0);
        let buf = dev.create_buffer(0, &mut mask).unwrap();
        buf.enable().unwrap();

        let mut block = buf.create_block(8).unwrap();
        block.enqueue(8, false).unwrap();

        let canceller = Arc::clone(&buf);
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            canceller.cancel();
        });
        assert!(matches!(block.dequeue(), Err(IiodError::Cancelled)));
        t.join().unwrap();
    }

    #[test]
    fn test_event_stream_nonblock_and_cancel() {
        let ctx = demo_context();
        let sim_dev = ctx.sim_device(0).unwrap();
        let dev = ctx.device(0).unwrap();
        let stream = dev.create_event_stream().unwrap();

        assert!(matches!(
            stream.read_event(true),
            Err(IiodError::WouldBlock)
        ));

        let ev = IioEvent {
            id: 7,
            timestamp: 1234,
        };
        sim_dev.push_event(ev);
        assert_eq!(stream.read_event(true).unwrap(), ev);

        stream.cancel();
        assert!(matches!(stream.read_event(false), Err(IiodError::Cancelled)));
    }
}
