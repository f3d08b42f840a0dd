//! Defines the bus access port that every board driver goes through to touch hardware

pub mod local;
pub mod mock;

use packed_struct::PackingError;
use std::time::Duration;
use thiserror::Error;

/// Types that implement this trait can be serialized such that they can be written to VME
/// registers
pub trait Serialize {
    type Chunk;
    /// # Errors
    /// Returns an error if the value can't be packed into its register layout
    fn serialize(&self) -> Result<Self::Chunk, PackingError>;
}

/// Types that implement this trait can be deserialized such that they can be read from VME
/// registers
pub trait Deserialize: Sized {
    type Chunk;
    /// # Errors
    /// Returns an error if the bytes don't unpack into the register layout
    fn deserialize(chunk: Self::Chunk) -> Result<Self, PackingError>;
}

/// Registers that sit at a fixed byte offset from their board's A24 base address
pub trait Offset {
    fn offset() -> u32;
}

// The bus is big-endian, so numbers go out and come back in network order

macro_rules! ser_num {
    ($num:ty) => {
        impl Serialize for $num {
            type Chunk = [u8; std::mem::size_of::<$num>()];
            fn serialize(&self) -> Result<Self::Chunk, PackingError> {
                Ok(self.to_be_bytes())
            }
        }
    };
}

macro_rules! deser_num {
    ($num:ty) => {
        impl Deserialize for $num {
            type Chunk = [u8; std::mem::size_of::<$num>()];
            fn deserialize(chunk: Self::Chunk) -> Result<Self, PackingError> {
                Ok(<$num>::from_be_bytes(chunk))
            }
        }
    };
}

ser_num!(u8);
ser_num!(u16);
ser_num!(u32);
ser_num!(i8);
ser_num!(i16);
ser_num!(i32);

deser_num!(u8);
deser_num!(u16);
deser_num!(u32);
deser_num!(i8);
deser_num!(i16);
deser_num!(i32);

/// VME address spaces (address modifiers) the boards respond in
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    A16,
    A24,
    A32,
}

/// The operating system flavor of the VME driver that produced a DMA wait result.
///
/// The two drivers disagree on what the wait result counts, so the raw number is only meaningful
/// together with this tag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Platform {
    /// The Linux `jvme` driver: the raw value is the number of bytes transferred
    #[default]
    Linux,
    /// The VxWorks `sysVmeDmaDone` driver: the raw value is the number of bytes *remaining*
    VxWorks,
}

/// The untouched result of waiting on the DMA engine, tagged with the platform that made it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaWait {
    pub platform: Platform,
    pub raw: i32,
}

/// A block transfer from a board's bus address into local memory
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaRequest {
    /// The address space of `source`
    pub space: AddressSpace,
    /// The bus address the board (or multiblock chain) serves data from
    pub source: u32,
    /// Local address of the first destination word
    pub local_addr: usize,
    /// Number of bytes requested
    pub nbytes: usize,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("No board responded at {space:?} address {addr:#010x}")]
    BusTimeout { space: AddressSpace, addr: u32 },
    #[error("Unsupported data width of {0} bytes")]
    Width(usize),
    #[error("Register packing failed - {0:?}")]
    Packing(PackingError),
    #[error("The DMA engine refused to start - {0}")]
    DmaStart(String),
    #[error("Timed out after {0:?} waiting for the DMA engine")]
    DmaTimeout(Duration),
    #[error("The DMA engine reported a failure - {0}")]
    DmaEngine(String),
    #[error("No DMA transfer is in flight")]
    NoTransfer,
    #[error(transparent)]
    Local(#[from] local::Error),
}

impl From<PackingError> for Error {
    fn from(e: PackingError) -> Self {
        Error::Packing(e)
    }
}

pub type BusResult<T> = Result<T, Error>;

/// The trait that is implemented for every way of reaching a VME/VXS crate.
///
/// None of these methods are safe to interleave between threads against the same board; callers
/// serialize through their registry lock.
pub trait Bus {
    /// Perform a single `N` byte read cycle (N = 1, 2 or 4) at `addr`, returning the bytes in
    /// bus (big-endian) order
    fn read_bytes<const N: usize>(&mut self, space: AddressSpace, addr: u32)
        -> BusResult<[u8; N]>;

    /// Perform a single write cycle of `data` (1, 2 or 4 bytes, bus order) at `addr`
    fn write_bytes(&mut self, space: AddressSpace, addr: u32, data: &[u8]) -> BusResult<()>;

    /// Generically read a `Deserialize` type `T` from `addr`
    /// # Example
    /// ```
    /// # use codavme::bus::{mock::Mock, AddressSpace, Bus};
    /// # let mut bus = Mock::new();
    /// # bus.map(AddressSpace::A24, 0x28_0000, 0x100);
    /// let version: u32 = bus.read(AddressSpace::A24, 0x28_0000).unwrap();
    /// ```
    fn read<T, const N: usize>(&mut self, space: AddressSpace, addr: u32) -> BusResult<T>
    where
        T: Deserialize<Chunk = [u8; N]>,
    {
        let bytes: [u8; N] = self.read_bytes(space, addr)?;
        Ok(T::deserialize(bytes)?)
    }

    /// Generically write a `Serialize` type `T` to `addr`
    /// # Example
    /// ```
    /// # use codavme::bus::{mock::Mock, AddressSpace, Bus};
    /// # let mut bus = Mock::new();
    /// # bus.map(AddressSpace::A24, 0x28_0000, 0x100);
    /// bus.write(AddressSpace::A24, 0x28_0010, &0x0000_0004u32).unwrap();
    /// ```
    fn write<T, const N: usize>(&mut self, space: AddressSpace, addr: u32, data: &T) -> BusResult<()>
    where
        T: Serialize<Chunk = [u8; N]>,
    {
        self.write_bytes(space, addr, &data.serialize()?)
    }

    /// Read the register `R` of the board whose A24 registers start at `base`
    fn read_reg<R, const N: usize>(&mut self, base: u32) -> BusResult<R>
    where
        R: Offset + Deserialize<Chunk = [u8; N]>,
    {
        self.read(AddressSpace::A24, base + R::offset())
    }

    /// Write the register `R` of the board whose A24 registers start at `base`
    fn write_reg<R, const N: usize>(&mut self, base: u32, reg: &R) -> BusResult<()>
    where
        R: Offset + Serialize<Chunk = [u8; N]>,
    {
        self.write(AddressSpace::A24, base + R::offset(), reg)
    }

    /// Program and start a block transfer. Returns as soon as the engine is running.
    fn start_dma(&mut self, request: &DmaRequest) -> BusResult<()>;

    /// Block until the running transfer finishes or `timeout` elapses. The transferred words land
    /// in `dest` exactly as they came off the bus (big-endian).
    fn wait_dma(&mut self, dest: &mut [u32], timeout: Duration) -> BusResult<DmaWait>;
}
