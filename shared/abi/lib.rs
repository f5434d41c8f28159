/*!
The ABI contract between the wasmgauge harness and the workload guests.

Every workload, regardless of which code generator produced it, compiles to a
WASM module exporting the same three entry points plus its linear memory.
This crate is the single place where the names and the parameter block layout
are written down. The harness depends on it, and guest implementations
written in Rust can depend on it too; guests written in other languages
mirror the constants by hand.
*/

/// The exported function that re-seeds a guest's mutable state.
///
/// Signature: `init(seed: u32)`. The guest must derive all of its input data
/// (pixel buffers, record sets, matrices) deterministically from the seed,
/// and calling `init` again with the same seed must restore the exact same
/// pre-iteration state.
pub const INIT: &str = "init";

/// The exported bump allocator used by the harness to place the parameter
/// block inside guest memory.
///
/// Signature: `alloc(bytes: u32) -> u32`, returning an offset into the
/// guest's linear memory. Guests are free to never reclaim this memory; the
/// harness allocates exactly once per instantiation.
pub const ALLOC: &str = "alloc";

/// The exported function that runs one iteration of the workload.
///
/// Signature: `run_task(params_ptr: u32) -> u32`. The pointer refers to a
/// [`ParamsBlock`] previously written by the harness, and the return value is
/// the workload's 32-bit result digest.
pub const RUN_TASK: &str = "run_task";

/// The name of the exported linear memory.
pub const MEMORY: &str = "memory";

/// The parameter block passed to `run_task`, laid out in guest memory as
/// three consecutive little-endian `u32`s.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParamsBlock {
    /// The principal size of the workload (image edge, record count, matrix
    /// dimension).
    pub size: u32,
    /// A secondary iteration count for workloads that have one (for example
    /// the escape-iteration limit of the Mandelbrot renderer). Workloads
    /// without one ignore it.
    pub iters: u32,
    /// The seed the guest was initialized with. Included so a guest can
    /// verify it against its `init`-time state if it chooses to.
    pub seed: u32,
}

impl ParamsBlock {
    /// The number of bytes a parameter block occupies in guest memory.
    pub const LEN: usize = 12;

    /// Encode this block for writing into guest memory.
    pub fn to_bytes(&self) -> [u8; ParamsBlock::LEN] {
        let mut buf = [0u8; ParamsBlock::LEN];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.iters.to_le_bytes());
        buf[8..12].copy_from_slice(&self.seed.to_le_bytes());
        buf
    }

    /// Decode a block from guest memory bytes.
    pub fn from_bytes(buf: &[u8]) -> anyhow::Result<ParamsBlock> {
        anyhow::ensure!(
            buf.len() >= ParamsBlock::LEN,
            "parameter block needs {} bytes but only {} were given",
            ParamsBlock::LEN,
            buf.len(),
        );
        let word = |i: usize| {
            u32::from_le_bytes([
                buf[4 * i],
                buf[4 * i + 1],
                buf[4 * i + 2],
                buf[4 * i + 3],
            ])
        };
        Ok(ParamsBlock { size: word(0), iters: word(1), seed: word(2) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_round_trip() {
        let block = ParamsBlock { size: 512, iters: 1000, seed: 0xDEAD_BEEF };
        let bytes = block.to_bytes();
        assert_eq!(bytes.len(), ParamsBlock::LEN);
        assert_eq!(ParamsBlock::from_bytes(&bytes).unwrap(), block);
    }

    #[test]
    fn params_too_short() {
        assert!(ParamsBlock::from_bytes(&[0u8; 11]).is_err());
    }
}
