//! Per-client sample demultiplexing.
//!
//! The kernel may honor a superset of the channels a client asked for
//! (mask reconciliation). When demux is enabled, RX payloads are
//! re-sliced sample frame by sample frame so the client only sees the
//! channels it requested, in scan order. The backend reports a packed
//! frame layout: enabled channels in index order, `sample_size` bytes
//! each, no padding.

use bytes::{Bytes, BytesMut};

use iiod_core::mask::ChannelMask;

/// Bytes of one full scan frame for the channels enabled in `mask`.
#[must_use]
pub fn frame_size(mask: &ChannelMask, sample_sizes: &[usize]) -> usize {
    mask.iter().map(|chn| sample_sizes[chn]).sum()
}

/// Whether `data` needs re-slicing for this client at all.
#[must_use]
pub fn needs_demux(kernel: &ChannelMask, client: &ChannelMask) -> bool {
    client != kernel
}

/// Extract the client's channels from a kernel buffer slice.
///
/// `data` holds whole frames laid out per `kernel`; the result holds the
/// same frames restricted to the channels of `client` (which must be a
/// subset of `kernel`). A trailing partial frame is dropped.
#[must_use]
pub fn demux_samples(
    data: &[u8],
    kernel: &ChannelMask,
    client: &ChannelMask,
    sample_sizes: &[usize],
) -> Bytes {
    let in_frame = frame_size(kernel, sample_sizes);
    if in_frame == 0 {
        return Bytes::new();
    }
    let out_frame = frame_size(client, sample_sizes);
    let nb_frames = data.len() / in_frame;

    let mut out = BytesMut::with_capacity(nb_frames * out_frame);
    for frame in data.chunks_exact(in_frame) {
        let mut offset = 0;
        for chn in kernel.iter() {
            let size = sample_sizes[chn];
            if client.test(chn) {
                out.extend_from_slice(&frame[offset..offset + size]);
            }
            offset += size;
        }
    }
    out.freeze()
}
