// ring-node/src/routing/table.rs
use std::fmt;

use crate::id::{PeerIdentity, DIGITS};

/// Columns per row: one per hex digit value.
pub const COLUMNS: usize = 16;

/// Prefix routing table: row `r` holds peers sharing the first `r` digits with
/// the owner, column `c` is the value of their digit `r`.
///
/// Slots are never overwritten. A peer whose slot is taken is simply not
/// recorded here, even if that leaves it unreachable through the table until
/// another broadcast brings it back.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingTable {
    owner: PeerIdentity,
    slots: [[Option<PeerIdentity>; COLUMNS]; DIGITS],
}

impl RoutingTable {
    /// A table holding only its owner, on the owner's diagonal.
    pub fn new(owner: PeerIdentity) -> Self {
        let mut table = Self {
            owner,
            slots: Default::default(),
        };
        for row in 0..DIGITS {
            let col = table.owner.id.digit(row);
            table.slots[row][col] = Some(table.owner.clone());
        }
        table
    }

    /// Rebuild a table from decoded slots, exactly as sent.
    pub fn from_slots(owner: PeerIdentity, slots: [[Option<PeerIdentity>; COLUMNS]; DIGITS]) -> Self {
        Self { owner, slots }
    }

    pub fn owner(&self) -> &PeerIdentity {
        &self.owner
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&PeerIdentity> {
        self.slots.get(row)?.get(col)?.as_ref()
    }

    /// Slot a peer belongs in relative to the owner.
    pub fn slot_for(&self, peer: &PeerIdentity) -> (usize, usize) {
        let row = self.owner.id.first_difference(peer.id);
        (row, peer.id.digit(row))
    }

    /// Insert into the peer's slot if it is empty. Returns whether it was inserted.
    pub fn add(&mut self, peer: PeerIdentity) -> bool {
        let (row, col) = self.slot_for(&peer);
        match self.slots[row][col] {
            Some(_) => false,
            None => {
                self.slots[row][col] = Some(peer);
                true
            }
        }
    }

    /// Clear the slot holding `peer`, if any.
    pub fn remove(&mut self, peer: &PeerIdentity) -> bool {
        for row in self.slots.iter_mut() {
            for slot in row.iter_mut() {
                if slot.as_ref() == Some(peer) {
                    *slot = None;
                    return true;
                }
            }
        }
        false
    }

    /// Every occupied slot in row-major order, owner included.
    pub fn entries(&self) -> impl Iterator<Item = &PeerIdentity> {
        self.slots.iter().flat_map(|row| row.iter().flatten())
    }

    /// Every occupied slot in row-major order, excluding the owner's diagonal.
    pub fn others(&self) -> impl Iterator<Item = &PeerIdentity> {
        self.entries().filter(move |peer| *peer != &self.owner)
    }

    pub(crate) fn slots(&self) -> &[[Option<PeerIdentity>; COLUMNS]; DIGITS] {
        &self.slots
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, row) in self.slots.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            let cells: Vec<String> = row
                .iter()
                .map(|slot| match slot {
                    Some(peer) => peer.id.to_string(),
                    None => "----".to_string(),
                })
                .collect();
            f.write_str(&cells.join(" "))?;
        }
        Ok(())
    }
}
