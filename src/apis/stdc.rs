//! C runtime calls recorded alongside GL
//!
//! `malloc` and `memcpy` show up in traces of applications that map buffer
//! objects and fill them by hand. Replay keeps its own copy of each traced
//! allocation so later copies into or out of it land somewhere.

use crate::call::{Call, Value};
use crate::error::Result;
use crate::player::Entry;
use crate::state::ReplayState;
use std::collections::BTreeMap;

pub const CALLBACKS: &[Entry] = &[
    Entry { name: "malloc", callback: play_malloc },
    Entry { name: "free", callback: play_free },
    Entry { name: "memcpy", callback: play_memcpy },
];

/// Replay-side backing store for traced allocations, keyed by trace address
#[derive(Debug, Default)]
pub struct MemoryRegions {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl MemoryRegions {
    pub fn add(&mut self, address: u64, size: usize) {
        self.regions.insert(address, vec![0; size]);
    }

    pub fn remove(&mut self, address: u64) -> bool {
        self.regions.remove(&address).is_some()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Region containing `[address, address + len)`, as (base, bytes)
    fn locate(&self, address: u64, len: usize) -> Option<(u64, usize)> {
        let (base, bytes) = self.regions.range(..=address).next_back()?;
        let start = (address - base) as usize;
        (start + len <= bytes.len()).then_some((*base, start))
    }

    pub fn read(&self, address: u64, len: usize) -> Option<&[u8]> {
        let (base, start) = self.locate(address, len)?;
        self.regions.get(&base).map(|bytes| &bytes[start..start + len])
    }

    pub fn write(&mut self, address: u64, data: &[u8]) -> bool {
        let Some((base, start)) = self.locate(address, data.len()) else {
            return false;
        };
        match self.regions.get_mut(&base) {
            Some(bytes) => {
                bytes[start..start + data.len()].copy_from_slice(data);
                true
            }
            None => false,
        }
    }
}

fn play_malloc(state: &mut ReplayState, call: &Call) -> Result<()> {
    let address = call.ret_or_null().to_uint_ptr();
    if address != 0 {
        state.regions.add(address, call.arg(0).to_uint() as usize);
    }
    Ok(())
}

fn play_free(state: &mut ReplayState, call: &Call) -> Result<()> {
    state.regions.remove(call.arg(0).to_uint_ptr());
    Ok(())
}

fn play_memcpy(state: &mut ReplayState, call: &Call) -> Result<()> {
    let dest = call.arg(0).to_uint_ptr();
    let n = call.arg(2).to_uint() as usize;
    if dest == 0 || n == 0 {
        return Ok(());
    }

    let data = match call.arg(1) {
        Value::Blob(bytes) => bytes.get(..n).map(<[u8]>::to_vec),
        src => state.regions.read(src.to_uint_ptr(), n).map(<[u8]>::to_vec),
    };
    let Some(data) = data else {
        state.warning(call, "memcpy source is not a known memory region");
        return Ok(());
    };
    if !state.regions.write(dest, &data) {
        state.warning(call, format!("memcpy destination 0x{:x} is not a known memory region", dest));
    }
    Ok(())
}
