//! Register cache.
//!
//! While a def is compiled, the cache tracks which stack slots currently
//! live in which machine register. Registers are described by a
//! [`RegisterFile`] of allocation units: on targets where every register
//! holds four lanes a unit is one register, on ARMv7 a unit is one `S`
//! register and a vector takes a bank of four. The cache itself never emits
//! code; loads and stores go through a [`SlotIo`].
//!
//! Live slots never overlap on the stack. A request that partially overlaps
//! a resident slot either reuses it (same slot, or a scalar lane the target
//! can address) or pushes it out first.

use serde::Serialize;
use tracing::warn;

use crate::vm::LmntError;

/// Number of stack values an access covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Scalar,
    Vector,
}

impl Width {
    pub fn slots(self) -> u16 {
        match self {
            Width::Scalar => 1,
            Width::Vector => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// How a requested stack range relates to a resident one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    None,
    /// Same range.
    Aligned,
    /// Request lies inside the resident range, starting at its first slot.
    AlignedSubset,
    /// Resident range lies inside the request, starting at its first slot.
    AlignedSuperset,
    /// Request lies inside the resident range at a later slot.
    Subset,
    /// Resident range lies inside the request at a later slot.
    Superset,
    /// The ranges straddle each other.
    Unaligned,
}

/// Classify request `[pos, pos + width)` against resident `[rpos, rpos + rwidth)`.
pub fn overlap(pos: u16, width: Width, rpos: u16, rwidth: Width) -> Overlap {
    let (start, end) = (pos as u32, pos as u32 + width.slots() as u32);
    let (rstart, rend) = (rpos as u32, rpos as u32 + rwidth.slots() as u32);
    if end <= rstart || rend <= start {
        Overlap::None
    } else if start == rstart && end == rend {
        Overlap::Aligned
    } else if start >= rstart && end <= rend {
        if start == rstart { Overlap::AlignedSubset } else { Overlap::Subset }
    } else if rstart >= start && rend <= end {
        if start == rstart { Overlap::AlignedSuperset } else { Overlap::Superset }
    } else {
        Overlap::Unaligned
    }
}

/// Shape of the cacheable registers of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFile {
    /// Allocation units available to the cache.
    pub units: u8,
    /// Units one vector occupies; zero when vectors cannot be cached.
    pub vector_span: u8,
    /// Whether a scalar in any lane of a resident vector is addressable.
    pub lane_access: bool,
}

impl RegisterFile {
    /// Every register holds a scalar or a whole vector.
    pub fn flat(units: u8) -> Self {
        RegisterFile { units, vector_span: 1, lane_access: false }
    }

    /// Scalar registers grouped into four-lane banks (ARMv7 NEON).
    pub fn banked(units: u8) -> Self {
        RegisterFile { units, vector_span: 4, lane_access: true }
    }

    /// Scalar registers only (ARMv7-M VFP).
    pub fn scalar_only(units: u8) -> Self {
        RegisterFile { units, vector_span: 0, lane_access: false }
    }

    pub fn span(&self, width: Width) -> u8 {
        match width {
            Width::Scalar => 1,
            Width::Vector => self.vector_span,
        }
    }

    /// First unit of the bank containing `unit`.
    pub fn bank_start(&self, unit: u8) -> u8 {
        if self.vector_span > 1 { unit - unit % self.vector_span } else { unit }
    }
}

/// A stack range resident in a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub pos: u16,
    pub width: Width,
    /// Written since it was loaded; must be stored before it is dropped.
    pub modified: bool,
}

/// Register allocation statistics for one compiled def.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegStats {
    pub reg_alloc: u32,
    pub reg_aligned: u32,
    pub reg_unaligned: u32,
    pub reg_evicted: u32,
    pub reg_evicted_written: u32,
}

/// Emits the moves between registers and the stack the cache asks for.
pub trait SlotIo {
    fn load(&mut self, unit: u8, pos: u16, width: Width);
    fn store(&mut self, unit: u8, pos: u16, width: Width);
}

/// Where an access should happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// In this unit (for a lane hit, the unit of that lane).
    Reg(u8),
    /// Not cached: go through a scratch register and the stack.
    Scratch,
}

pub struct RegisterCache {
    file: RegisterFile,
    /// Slot per head unit.
    slots: Vec<Option<Slot>>,
    /// Heads used by the instruction being compiled.
    locked: Vec<bool>,
    stats: RegStats,
    validate: bool,
}

impl RegisterCache {
    pub fn new(file: RegisterFile, validate: bool) -> Self {
        RegisterCache {
            file,
            slots: vec![None; file.units as usize],
            locked: vec![false; file.units as usize],
            stats: RegStats::default(),
            validate,
        }
    }

    pub fn file(&self) -> RegisterFile {
        self.file
    }

    pub fn stats(&self) -> RegStats {
        self.stats
    }

    pub fn slot(&self, unit: u8) -> Option<Slot> {
        self.slots.get(unit as usize).copied().flatten()
    }

    fn heads(&self) -> impl Iterator<Item = (u8, Slot)> + '_ {
        self.slots.iter().enumerate().filter_map(|(u, s)| s.map(|s| (u as u8, s)))
    }

    /// The head unit whose slot covers `unit`.
    fn owner(&self, unit: u8) -> Option<u8> {
        self.heads()
            .find(|(h, s)| *h <= unit && unit < h + self.file.span(s.width).max(1))
            .map(|(h, _)| h)
    }

    fn is_free(&self, start: u8, span: u8) -> bool {
        (start..start + span).all(|u| self.owner(u).is_none())
    }

    /// Find a register for `pos`, loading it for reads.
    pub fn acquire(
        &mut self,
        io: &mut impl SlotIo,
        pos: u16,
        width: Width,
        access: Access,
        importance: &dyn Fn(u16, Width) -> u32,
    ) -> Result<Acquired, LmntError> {
        let span = self.file.span(width);
        if span == 0 {
            return Ok(Acquired::Scratch);
        }

        let mut conflicts = Vec::new();
        let mut hit = None;
        for (head, slot) in self.heads() {
            match overlap(pos, width, slot.pos, slot.width) {
                Overlap::None => {}
                Overlap::Aligned | Overlap::AlignedSubset => hit = Some((head, head)),
                Overlap::Subset if self.file.lane_access && slot.width == Width::Vector => {
                    hit = Some((head, head + (pos - slot.pos) as u8))
                }
                _ => conflicts.push(head),
            }
        }

        if let Some((head, unit)) = hit {
            self.stats.reg_aligned += 1;
            self.locked[head as usize] = true;
            return self.checked(Acquired::Reg(unit));
        }

        if !conflicts.is_empty() {
            self.stats.reg_unaligned += 1;
            let wanted = importance(pos, width);
            let keep = access == Access::Read
                && conflicts.iter().any(|&h| {
                    self.locked[h as usize] || self.slot(h).is_some_and(|s| importance(s.pos, s.width) > wanted)
                });
            if keep {
                for &head in &conflicts {
                    self.flush(io, head);
                }
                return self.checked(Acquired::Scratch);
            }
            for &head in &conflicts {
                self.evict(io, head);
            }
        }

        let unit = match self.free_unit(span) {
            Some(unit) => unit,
            None => {
                let Some((start, cost)) = self.choose_victim(span, importance) else {
                    return self.checked(Acquired::Scratch);
                };
                if importance(pos, width) < cost {
                    return self.checked(Acquired::Scratch);
                }
                for unit in start..start + span {
                    if let Some(head) = self.owner(unit) {
                        self.evict(io, head);
                    }
                }
                start
            }
        };

        self.slots[unit as usize] = Some(Slot { pos, width, modified: false });
        self.locked[unit as usize] = true;
        self.stats.reg_alloc += 1;
        if access == Access::Read {
            io.load(unit, pos, width);
        }
        self.checked(Acquired::Reg(unit))
    }

    fn free_unit(&self, span: u8) -> Option<u8> {
        (0..self.file.units)
            .step_by(span as usize)
            .find(|&u| u + span <= self.file.units && self.is_free(u, span))
    }

    /// Cheapest unlocked range of `span` units to clear, with its cost.
    fn choose_victim(&self, span: u8, importance: &dyn Fn(u16, Width) -> u32) -> Option<(u8, u32)> {
        let mut best: Option<(u8, u32, bool)> = None;
        for start in (0..self.file.units).step_by(span as usize) {
            if start + span > self.file.units {
                break;
            }
            let mut cost = 0u32;
            let mut dirty = false;
            let mut usable = true;
            let mut seen = Vec::new();
            for unit in start..start + span {
                let Some(head) = self.owner(unit) else { continue };
                if seen.contains(&head) {
                    continue;
                }
                seen.push(head);
                // A slot reaching outside the range cannot be cleared with it.
                let Some(slot) = self.slot(head) else { continue };
                if self.locked[head as usize] || head < start || head + self.file.span(slot.width) > start + span {
                    usable = false;
                    break;
                }
                cost = cost.saturating_add(importance(slot.pos, slot.width));
                dirty |= slot.modified;
            }
            if !usable {
                continue;
            }
            // Prefer cheap, then clean, then low units.
            let better = match best {
                None => true,
                Some((_, c, d)) => cost < c || (cost == c && d && !dirty),
            };
            if better {
                best = Some((start, cost, dirty));
            }
        }
        best.map(|(start, cost, _)| (start, cost))
    }

    /// Record that the register holding `unit` was written.
    pub fn notify_written(&mut self, unit: u8) {
        if let Some(head) = self.owner(unit) {
            if let Some(slot) = self.slots[head as usize].as_mut() {
                slot.modified = true;
            }
        }
    }

    /// Store `head` back to the stack if it was modified; it stays resident.
    pub fn flush(&mut self, io: &mut impl SlotIo, head: u8) -> bool {
        match self.slots.get_mut(head as usize) {
            Some(Some(slot)) if slot.modified => {
                io.store(head, slot.pos, slot.width);
                slot.modified = false;
                true
            }
            _ => false,
        }
    }

    /// Flush `head` and drop it from the cache.
    pub fn evict(&mut self, io: &mut impl SlotIo, head: u8) {
        if self.slot(head).is_none() {
            return;
        }
        if self.flush(io, head) {
            self.stats.reg_evicted_written += 1;
        }
        self.stats.reg_evicted += 1;
        self.slots[head as usize] = None;
        self.locked[head as usize] = false;
    }

    /// Store every modified register. Values stay cached.
    pub fn flush_all(&mut self, io: &mut impl SlotIo) -> Result<(), LmntError> {
        for head in 0..self.file.units {
            self.flush(io, head);
        }
        self.checked(())
    }

    /// Store every modified register and forget all of them.
    pub fn invalidate_all(&mut self, io: &mut impl SlotIo) -> Result<(), LmntError> {
        self.flush_all(io)?;
        self.slots.iter_mut().for_each(|s| *s = None);
        self.unlock_all();
        Ok(())
    }

    /// Release the registers pinned by the previous instruction.
    pub fn unlock_all(&mut self) {
        self.locked.iter_mut().for_each(|l| *l = false);
    }

    fn checked<T>(&self, value: T) -> Result<T, LmntError> {
        if !self.validate {
            return Ok(value);
        }
        match self.check_invariants() {
            Ok(()) => Ok(value),
            Err(msg) => {
                warn!(%msg, "register cache invariant violated");
                Err(LmntError::Internal)
            }
        }
    }

    /// Check that resident slots neither share units nor stack values.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut owners = vec![None; self.file.units as usize];
        let heads: Vec<_> = self.heads().collect();
        for &(head, slot) in &heads {
            let span = self.file.span(slot.width);
            if span == 0 || head % span != 0 || head + span > self.file.units {
                return Err(format!("slot at unit {} has an invalid placement", head));
            }
            for unit in head..head + span {
                if let Some(other) = owners[unit as usize] {
                    return Err(format!("unit {} claimed by units {} and {}", unit, other, head));
                }
                owners[unit as usize] = Some(head);
            }
        }
        for (i, &(a, sa)) in heads.iter().enumerate() {
            for &(b, sb) in &heads[i + 1..] {
                if overlap(sa.pos, sa.width, sb.pos, sb.width) != Overlap::None {
                    return Err(format!("units {} and {} overlap on the stack at {}", a, b, sa.pos));
                }
            }
        }
        for (unit, &locked) in self.locked.iter().enumerate() {
            if locked && self.slots[unit].is_none() {
                return Err(format!("unit {} locked while empty", unit));
            }
        }
        Ok(())
    }
}
