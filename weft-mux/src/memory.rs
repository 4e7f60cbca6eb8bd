use std::io;

/// External capability that gates large buffer reservations.
///
/// A session reserves `2 * max_message_size` bytes per buffer slot once at
/// construction and releases the whole reservation once at teardown. The
/// priority hint ranks the slot: a session requests its first slot at
/// priority 255, the second at 192 and the rest at 128.
pub trait MemoryManager: Send + Sync {
    /// Reserve `size` bytes. An error declines the reservation.
    fn reserve_memory(&self, size: usize, priority: u8) -> io::Result<()>;
    /// Release `size` bytes previously reserved.
    fn release_memory(&self, size: usize);
}

/// Memory manager that grants everything and tracks nothing.
///
/// Substituted when a session is built without an explicit manager.
#[derive(Debug, Default)]
pub struct NullMemoryManager;

impl MemoryManager for NullMemoryManager {
    fn reserve_memory(&self, _size: usize, _priority: u8) -> io::Result<()> {
        Ok(())
    }

    fn release_memory(&self, _size: usize) {}
}
