//! Remote-memory access layer.
//!
//! [`MemorySource`] is the seam between the introspection logic and an
//! actual address space: the live process implements it with OS primitives,
//! tests implement it with crafted buffers. Everything above this module
//! reads remote memory exclusively through it.

mod process;
mod ptr;

pub use process::{MappedFileInfo, ModuleInfo, RemoteProcess};
pub use ptr::{MemRange, RemotePtr};

use bytemuck::{AnyBitPattern, NoUninit};

use crate::error::Result;

/// Raw, bounds-unaware access to a remote address space.
///
/// Reads and writes are non-retrying: a failure is reported to the caller,
/// who decides whether to retry, abandon, or treat it as the process having
/// gone away. A short read/write for a non-empty request is always an error.
pub trait MemorySource {
    fn read_raw(&mut self, addr: RemotePtr, out: &mut [u8]) -> Result<()>;

    fn write_raw(&mut self, addr: RemotePtr, data: &[u8]) -> Result<()>;

    /// Reads a plain-data value at `addr`.
    fn read<T: AnyBitPattern>(&mut self, addr: RemotePtr) -> Result<T>
    where
        Self: Sized,
    {
        let mut buf = vec![0u8; std::mem::size_of::<T>()];
        self.read_raw(addr, &mut buf)?;
        Ok(bytemuck::pod_read_unaligned(&buf))
    }

    /// Writes a plain-data value at `addr`.
    fn write<T: NoUninit>(&mut self, addr: RemotePtr, value: &T) -> Result<()>
    where
        Self: Sized,
    {
        self.write_raw(addr, bytemuck::bytes_of(value))
    }

    /// Reads a value through a pointer chain: every offset except the last
    /// dereferences a pointer-sized link, the last one addresses the value
    /// itself. `read_chain(a, &[x, y])` is `*(*(a + x) + y)`. An empty chain
    /// reads at `addr` directly. Fails atomically at the first broken link.
    fn read_chain<T: AnyBitPattern>(&mut self, addr: RemotePtr, offsets: &[u64]) -> Result<T>
    where
        Self: Sized,
    {
        let (last, links) = match offsets.split_last() {
            Some((last, links)) => (*last, links),
            None => return self.read(addr),
        };
        let mut addr = addr;
        for off in links {
            addr = self.read::<RemotePtr>(addr.offset(*off))?;
        }
        self.read(addr.offset(last))
    }

    /// Writes a value through a pointer chain; same addressing rules as
    /// [`read_chain`](Self::read_chain).
    fn write_chain<T: NoUninit>(
        &mut self,
        addr: RemotePtr,
        offsets: &[u64],
        value: &T,
    ) -> Result<()>
    where
        Self: Sized,
    {
        let (last, links) = match offsets.split_last() {
            Some((last, links)) => (*last, links),
            None => return self.write(addr, value),
        };
        let mut addr = addr;
        for off in links {
            addr = self.read::<RemotePtr>(addr.offset(*off))?;
        }
        self.write(addr.offset(last), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeMemory;

    #[test]
    fn chain_reads_follow_pointers() {
        let mut mem = FakeMemory::new();
        // a: struct with a pointer at +0x10 -> b; b: value at +0x8.
        let a = 0x1000u64;
        let b = 0x2000u64;
        mem.put_u64(a + 0x10, b);
        mem.put(b + 0x8, &0x1122_3344u32.to_le_bytes());

        // Single offset: plain read at addr + offset.
        assert_eq!(mem.read_chain::<RemotePtr>(RemotePtr(a), &[0x10]).unwrap(), RemotePtr(b));
        // Two offsets: dereference once, then read.
        assert_eq!(
            mem.read_chain::<u32>(RemotePtr(a), &[0x10, 0x8]).unwrap(),
            0x1122_3344
        );
        // Empty chain: read at the address itself.
        assert_eq!(
            mem.read_chain::<u64>(RemotePtr(a + 0x10), &[]).unwrap(),
            b
        );
    }

    #[test]
    fn chain_fails_at_the_first_broken_link() {
        let mut mem = FakeMemory::new();
        let a = 0x1000u64;
        mem.put_u64(a, 0xdead_0000);
        // The link dereferences fine, the final read doesn't.
        assert!(mem.read_chain::<u32>(RemotePtr(a), &[0x0, 0x8]).is_err());
        // The link itself is unmapped.
        assert!(mem.read_chain::<u32>(RemotePtr(0x9000), &[0x0, 0x8]).is_err());
    }

    #[test]
    fn chain_writes_land_at_the_resolved_address() {
        let mut mem = FakeMemory::new();
        let a = 0x1000u64;
        let b = 0x2000u64;
        mem.put_u64(a, b);
        mem.put(b + 0x4, &[0u8; 4]);

        mem.write_chain::<u32>(RemotePtr(a), &[0x0, 0x4], &7).unwrap();
        assert_eq!(mem.read_chain::<u32>(RemotePtr(a), &[0x0, 0x4]).unwrap(), 7);
        assert_eq!(mem.read::<u32>(RemotePtr(b + 0x4)).unwrap(), 7);
    }
}
