//! "Local" bus where the VME bridge windows are mapped into our address space through `/dev/mem`
//!
//! Only single cycles are supported. There is no portable way to drive a bridge's DMA engine from
//! user space, so block readout through this bus has to use programmed I/O.

use super::{
    AddressSpace,
    Bus,
    BusResult,
    DmaRequest,
    DmaWait,
};
use memmap2::{
    MmapMut,
    MmapOptions,
};
use nix::libc::O_SYNC;
use std::{
    fs::File,
    os::unix::fs::OpenOptionsExt,
    path::Path,
    ptr,
    time::Duration,
};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("File IO error")]
    IO(#[from] std::io::Error),
    #[error("No window maps {space:?} address {addr:#010x}")]
    Unmapped { space: AddressSpace, addr: u32 },
    #[error("Address {0:#010x} is not aligned to the access width")]
    Misaligned(u32),
    #[error("This bus has no DMA engine")]
    NoDmaEngine,
}

/// One slave window of the VME bridge as seen from the host
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Window {
    pub space: AddressSpace,
    /// First bus address the window covers
    pub bus_base: u32,
    /// Size of the window in bytes
    pub len: usize,
    /// Physical address the bridge presents the window at
    pub phys: u64,
}

#[derive(Debug)]
struct Mapped {
    window: Window,
    mem: MmapMut,
}

/// A local connection to the crate through memory mapped bridge windows
#[derive(Debug)]
pub struct Local {
    maps: Vec<Mapped>,
}

impl Local {
    /// Map every window through `/dev/mem`
    ///
    /// Note: This needs read/write access to `/dev/mem`
    /// # Errors
    /// Returns errors on file IO errors
    pub fn new(windows: &[Window]) -> Result<Self, Error> {
        Self::with_device("/dev/mem", windows)
    }

    /// Map every window through the memory device at `path`
    /// # Errors
    /// Returns errors on file IO errors
    pub fn with_device<P: AsRef<Path>>(path: P, windows: &[Window]) -> Result<Self, Error> {
        let mem = File::options()
            .read(true)
            .write(true)
            .custom_flags(O_SYNC)
            .open(path)?;
        let mut maps = vec![];
        for window in windows {
            // Safety: the device memory is only touched through volatile accesses below
            let mmap = unsafe {
                MmapOptions::new()
                    .len(window.len)
                    .offset(window.phys)
                    .map_mut(&mem)?
            };
            debug!(
                "Mapped {:?} window at {:#010x} ({} bytes)",
                window.space, window.bus_base, window.len
            );
            maps.push(Mapped {
                window: *window,
                mem: mmap,
            });
        }
        Ok(Self { maps })
    }

    fn locate(&mut self, space: AddressSpace, addr: u32, width: usize) -> Result<*mut u8, Error> {
        if addr as usize % width != 0 {
            return Err(Error::Misaligned(addr));
        }
        self.maps
            .iter_mut()
            .find(|m| {
                m.window.space == space
                    && addr >= m.window.bus_base
                    && (addr - m.window.bus_base) as usize + width <= m.window.len
            })
            .map(|m| {
                let offset = (addr - m.window.bus_base) as usize;
                // Safety: bounds were checked against the mapping length above
                unsafe { m.mem.as_mut_ptr().add(offset) }
            })
            .ok_or(Error::Unmapped { space, addr })
    }
}

// The bridge swaps bytes in hardware, so a volatile load sees the register's numeric value and
// the wire order is recovered with `to_be_bytes`.

impl Bus for Local {
    fn read_bytes<const N: usize>(
        &mut self,
        space: AddressSpace,
        addr: u32,
    ) -> BusResult<[u8; N]> {
        let ptr = self.locate(space, addr, N)?;
        let mut bytes = [0u8; N];
        // Safety: `locate` checked bounds and alignment for an N byte access
        unsafe {
            match N {
                1 => bytes.copy_from_slice(&ptr::read_volatile(ptr).to_be_bytes()),
                2 => bytes.copy_from_slice(&ptr::read_volatile(ptr.cast::<u16>()).to_be_bytes()),
                4 => bytes.copy_from_slice(&ptr::read_volatile(ptr.cast::<u32>()).to_be_bytes()),
                _ => return Err(super::Error::Width(N)),
            }
        }
        Ok(bytes)
    }

    fn write_bytes(&mut self, space: AddressSpace, addr: u32, data: &[u8]) -> BusResult<()> {
        let ptr = self.locate(space, addr, data.len())?;
        // Safety: `locate` checked bounds and alignment for this access width
        unsafe {
            match *data {
                [a] => ptr::write_volatile(ptr, a),
                [a, b] => ptr::write_volatile(ptr.cast::<u16>(), u16::from_be_bytes([a, b])),
                [a, b, c, d] => {
                    ptr::write_volatile(ptr.cast::<u32>(), u32::from_be_bytes([a, b, c, d]));
                }
                _ => return Err(super::Error::Width(data.len())),
            }
        }
        Ok(())
    }

    fn start_dma(&mut self, _request: &DmaRequest) -> BusResult<()> {
        Err(Error::NoDmaEngine.into())
    }

    fn wait_dma(&mut self, _dest: &mut [u32], _timeout: Duration) -> BusResult<DmaWait> {
        Err(Error::NoDmaEngine.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device() {
        let windows = [Window {
            space: AddressSpace::A24,
            bus_base: 0,
            len: 0x100_0000,
            phys: 0,
        }];
        assert!(matches!(
            Local::with_device("/this/device/does/not/exist", &windows),
            Err(Error::IO(_))
        ));
    }

    #[test]
    fn test_no_windows() {
        let mut bus = Local { maps: vec![] };
        let res: BusResult<u32> = bus.read(AddressSpace::A24, 0x28_0000);
        assert!(matches!(
            res,
            Err(super::super::Error::Local(Error::Unmapped { .. }))
        ));
        let res: BusResult<u32> = bus.read(AddressSpace::A24, 0x28_0002);
        assert!(matches!(
            res,
            Err(super::super::Error::Local(Error::Misaligned(0x28_0002)))
        ));
        assert!(matches!(
            bus.start_dma(&DmaRequest {
                space: AddressSpace::A32,
                source: 0x0800_0000,
                local_addr: 0,
                nbytes: 4
            }),
            Err(super::super::Error::Local(Error::NoDmaEngine))
        ));
    }
}
