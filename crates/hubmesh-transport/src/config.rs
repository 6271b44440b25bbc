/// Configuration for in-process links created by a
/// [`MemoryTransport`](crate::MemoryTransport).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use hubmesh_transport::LinkConfig;
///
/// let config = LinkConfig::new()
///     .max_frame_size(64 * 1024)
///     .buffer(512);
/// ```
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Maximum outgoing frame size in bytes.
    pub(crate) max_frame_size: usize,
    /// Channel capacity for peer events delivered to the owner.
    pub(crate) buffer: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkConfig {
    /// Create a new config with defaults.
    ///
    /// If the `HUBMESH_MAX_FRAME_SIZE` environment variable holds a byte
    /// count it replaces the 1 MB default. Override with
    /// [`.max_frame_size()`](Self::max_frame_size).
    pub fn new() -> Self {
        let max_frame_size = std::env::var("HUBMESH_MAX_FRAME_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1024 * 1024);

        Self {
            max_frame_size,
            buffer: 1024,
        }
    }

    /// Set the maximum frame size (default: 1 MB).
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Set the event channel capacity (default: 1024).
    pub fn buffer(mut self, capacity: usize) -> Self {
        self.buffer = capacity.max(1);
        self
    }
}
