use bytes::{Buf, BufMut};

use super::machine::ValidationError;
use crate::types::{Address, Hash, U256};
use crate::wire::{get_list, put_list, Decode, Encode, WireError};

/// Uniquely identifies an asset by blockchain + holder contract.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Asset {
    pub chain_id: U256,
    pub holder: Address,
}

/// Funds earmarked to a child channel; untouched by plain updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAlloc {
    pub id: Hash,
    pub bals: Vec<U256>,
}

/// How the channel's funds are split between the participants.
///
/// `of_parts[p][a]` is the balance participant `p` holds of asset `a`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Allocation {
    pub assets: Vec<Asset>,
    pub of_parts: Vec<Vec<U256>>,
    pub locked: Vec<SubAlloc>,
}

impl Allocation {
    pub fn new(assets: Vec<Asset>, of_parts: Vec<Vec<U256>>) -> Self {
        Allocation {
            assets,
            of_parts,
            locked: Vec::new(),
        }
    }

    /// Checks that the allocation is well formed: at least one participant
    /// row, and every live and locked row covering every asset.
    pub fn valid(&self) -> Result<(), ValidationError> {
        if self.of_parts.is_empty() {
            return Err(ValidationError::Allocation("no participant balances"));
        }
        for row in &self.of_parts {
            if row.len() != self.assets.len() {
                return Err(ValidationError::Allocation(
                    "participant row does not cover every asset",
                ));
            }
        }
        for sub in &self.locked {
            if sub.bals.len() != self.assets.len() {
                return Err(ValidationError::Allocation(
                    "locked sub-allocation does not cover every asset",
                ));
            }
        }
        Ok(())
    }

    /// Per-asset totals over live and locked balances, with overflow checked.
    pub fn sum(&self) -> Result<Vec<U256>, ValidationError> {
        let mut totals = vec![U256::zero(); self.assets.len()];
        for row in &self.of_parts {
            for (total, bal) in totals.iter_mut().zip(row) {
                *total = total.checked_add(*bal).ok_or(ValidationError::Overflow)?;
            }
        }
        for sub in &self.locked {
            for (total, bal) in totals.iter_mut().zip(&sub.bals) {
                *total = total.checked_add(*bal).ok_or(ValidationError::Overflow)?;
            }
        }
        Ok(totals)
    }

    /// Whether two allocations bind the same total funds per asset.
    pub fn equal_sum(a: &Allocation, b: &Allocation) -> Result<bool, ValidationError> {
        Ok(a.sum()? == b.sum()?)
    }
}

impl Encode for Asset {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        self.chain_id.encode(buf)?;
        self.holder.encode(buf)
    }
}

impl Decode for Asset {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(Asset {
            chain_id: U256::decode(buf)?,
            holder: Address::decode(buf)?,
        })
    }
}

impl Encode for SubAlloc {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        self.id.encode(buf)?;
        put_list(buf, &self.bals)
    }
}

impl Decode for SubAlloc {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(SubAlloc {
            id: Hash::decode(buf)?,
            bals: get_list(buf)?,
        })
    }
}

// Participant rows are wrapped so the nested list gets its own length prefix.
struct Row<'a>(&'a [U256]);

impl Encode for Row<'_> {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        put_list(buf, self.0)
    }
}

impl Encode for Allocation {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        put_list(buf, &self.assets)?;
        let rows: Vec<Row> = self.of_parts.iter().map(|r| Row(r)).collect();
        put_list(buf, &rows)?;
        put_list(buf, &self.locked)
    }
}

impl Decode for Allocation {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        let assets = get_list(buf)?;
        let rows = u16::decode(buf)? as usize;
        let mut of_parts = Vec::with_capacity(rows);
        for _ in 0..rows {
            of_parts.push(get_list(buf)?);
        }
        let locked = get_list(buf)?;
        Ok(Allocation {
            assets,
            of_parts,
            locked,
        })
    }
}
