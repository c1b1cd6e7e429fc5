//! Audio Processor Trait
//!
//! Defines the interface for in-place mono processors (filters, dynamics)
//! that the audio graph hosts as processing units.

/// Context passed to processors containing render metadata
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessContext {
    pub sample_rate: f32,
    /// Frames in the current render quantum
    pub block_size: usize,
}

impl ProcessContext {
    pub fn new(sample_rate: f32, block_size: usize) -> Self {
        Self {
            sample_rate,
            block_size,
        }
    }
}

/// Trait for processors in the render graph
///
/// # Real-time Safety Contract
///
/// Implementors MUST follow these rules in `process()`:
/// - NO heap allocations (no Vec::push, no Box::new, no String)
/// - NO syscalls (no file I/O, no network, no mutex locks)
/// - NO unbounded loops
/// - Constant or O(n) time complexity where n = block size
///
/// Violating these rules causes audio dropouts ("glitches").
pub trait AudioProcessor: Send {
    /// Process a mono block in-place
    fn process(&mut self, block: &mut [f32], context: &ProcessContext);

    /// Reset internal state (delay lines, envelopes, etc.)
    fn reset(&mut self);

    /// Human-readable name for debugging
    fn name(&self) -> &'static str;
}
