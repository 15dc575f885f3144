use crate::utils::size_fits;

/// Device-wide capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapFlags {
    /// Buffered data may be dropped on overflow instead of latching an error
    pub auto_buffer_flush: bool,
    /// The engine can throttle its input on consumer fullness
    pub pull_mode: bool,
    /// Periodic TS packet insertion is available
    pub ts_insertion: bool,
    /// Video index entries can be generated on recordings
    pub video_indexing: bool,
    /// The raw input may come from protected memory
    pub secured_input_playback: bool,
}

/// Limits on one class of buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferCaps {
    pub max_size: usize,
    /// Required size multiple, 0 for none
    pub size_alignment: usize,
    /// Storage may be allocated by this crate
    pub internal: bool,
    /// Storage may be provided by the caller
    pub external: bool,
    /// Decoder buffers may form a linear group
    pub linear_group: bool,
    /// Most decoder buffers in a group
    pub max_buffer_num: usize,
}

impl BufferCaps {
    /// Limits that accept any size up to `max_size` in either mode.
    pub fn unrestricted(max_size: usize) -> Self {
        Self {
            max_size,
            size_alignment: 0,
            internal: true,
            external: true,
            linear_group: true,
            max_buffer_num: 32,
        }
    }

    pub fn accepts(&self, size: usize) -> bool {
        size_fits(size, self.max_size, self.size_alignment)
    }

    /// Only caller-provided storage is supported.
    pub fn external_only(&self) -> bool {
        !self.internal && self.external
    }
}

/// Capabilities advertised by a demux engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxCaps {
    pub flags: CapFlags,
    /// Most cipher operations per PID
    pub num_cipher_ops: usize,
    pub section: BufferCaps,
    pub pes: BufferCaps,
    pub recording_188: BufferCaps,
    pub recording_192: BufferCaps,
    pub playback_188: BufferCaps,
    pub playback_192: BufferCaps,
    pub decoder: BufferCaps,
}

impl DemuxCaps {
    /// Recording limits for the given TS packet size.
    pub fn recording(&self, tsp_size: usize) -> &BufferCaps {
        if tsp_size == 188 {
            &self.recording_188
        } else {
            &self.recording_192
        }
    }

    /// Playback limits for the given TS packet size.
    pub fn playback(&self, tsp_size: usize) -> &BufferCaps {
        if tsp_size == 188 {
            &self.playback_188
        } else {
            &self.playback_192
        }
    }
}
