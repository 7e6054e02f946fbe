//! Algorithmic SID <-> POSIX-ID mapping (Component A, mapping half).
//!
//! The POSIX ID space `[lower, upper]` is partitioned into consecutive
//! slices of size `range_size`. Each slice is pinned to one domain SID; a
//! SID within that domain maps to `slice_base + (rid - first_rid)`.
//! Grounded on `sss_idmap_calculate_range`/`sss_idmap_add_domain_ex` from
//! `original_source/src/lib/idmap/sss_idmap.h`.

use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

use crate::error::{ResponderError, Result};
use crate::sid::Sid;

#[derive(Debug, Clone)]
pub struct IdRange {
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone)]
struct Slice {
    domain_sid: Sid,
    range: IdRange,
    range_id: Option<String>,
    first_rid: u32,
    external: bool,
    slice_num: u32,
}

/// Owned, non-global idmap context. No hidden state: construct one per
/// `ResponderContext` and thread it explicitly.
pub struct IdmapContext {
    lower: u32,
    upper: u32,
    range_size: u32,
    max_slices: u32,
    autorid: bool,
    slices: Vec<Slice>,
}

impl IdmapContext {
    pub fn new(lower: u32, upper: u32, range_size: u32, autorid: bool) -> Self {
        let max_slices = ((upper - lower + 1) / range_size).max(1);
        Self {
            lower,
            upper,
            range_size,
            max_slices,
            autorid,
            slices: Vec::new(),
        }
    }

    fn slice_bounds(&self, slice_num: u32) -> IdRange {
        let base = self.lower + slice_num * self.range_size;
        IdRange {
            min: base,
            max: base + self.range_size - 1,
        }
    }

    fn slice_occupied(&self, slice_num: u32) -> bool {
        self.slices.iter().any(|s| s.slice_num == slice_num)
    }

    fn preferred_slice(&self, domain_sid: &Sid) -> u32 {
        let mut hasher = FxHasher::default();
        domain_sid.to_string().hash(&mut hasher);
        (hasher.finish() % self.max_slices as u64) as u32
    }

    /// Computes the range for a domain SID, optionally pinned to a specific
    /// slice. Probes forward from the preferred slice on collision.
    pub fn calculate_range(&self, domain_sid: &Sid, slice_num: Option<u32>) -> Result<(u32, IdRange)> {
        match slice_num {
            Some(n) => {
                if n >= self.max_slices {
                    return Err(ResponderError::OutOfSlices);
                }
                if self.slice_occupied(n) {
                    return Err(ResponderError::Collision(format!("slice {n} occupied")));
                }
                Ok((n, self.slice_bounds(n)))
            }
            None => {
                let start = if self.autorid {
                    1
                } else {
                    self.preferred_slice(domain_sid)
                };
                for offset in 0..self.max_slices {
                    let candidate = (start + offset) % self.max_slices;
                    if candidate == 0 && self.autorid && !self.slices.is_empty() {
                        continue;
                    }
                    if !self.slice_occupied(candidate) {
                        return Ok((candidate, self.slice_bounds(candidate)));
                    }
                }
                Err(ResponderError::OutOfSlices)
            }
        }
    }

    /// Registers a domain's range. `slice_num = None` means "autorid slice
    /// 0 if this is the first domain added, else pick algorithmically" when
    /// autorid is enabled; otherwise it picks the deterministic preferred
    /// slice (probing on collision).
    pub fn add_domain_ex(
        &mut self,
        domain_name: &str,
        domain_sid: &Sid,
        slice_num: Option<u32>,
        range_id: Option<String>,
        first_rid: u32,
        external: bool,
    ) -> Result<()> {
        if domain_name.is_empty() {
            return Err(ResponderError::NoDomain);
        }

        if let Some(id) = &range_id {
            for s in &self.slices {
                if s.range_id.as_deref() == Some(id.as_str()) && &s.domain_sid != domain_sid {
                    return Err(ResponderError::Collision(format!(
                        "range_id {id} already bound to a different domain SID"
                    )));
                }
            }
        }

        for s in &self.slices {
            if s.domain_sid == *domain_sid && s.external != external {
                return Err(ResponderError::Collision(
                    "domain SID cannot mix algorithmic and external ranges".into(),
                ));
            }
        }

        let effective_slice = if self.autorid && slice_num.is_none() && self.slices.is_empty() {
            Some(0)
        } else {
            slice_num
        };

        let (slice, range) = self.calculate_range(domain_sid, effective_slice)?;

        for s in &self.slices {
            if s.domain_sid != *domain_sid && ranges_overlap(&s.range, &range) {
                return Err(ResponderError::Collision(format!(
                    "range for {domain_sid} overlaps existing range owned by {}",
                    s.domain_sid
                )));
            }
        }

        self.slices.push(Slice {
            domain_sid: domain_sid.clone(),
            range,
            range_id,
            first_rid,
            external,
            slice_num: slice,
        });
        Ok(())
    }

    pub fn sid_to_unix(&self, sid: &Sid) -> Result<u32> {
        if !sid.is_domain_sid() {
            return Err(ResponderError::BuiltinSid);
        }
        let prefix = sid.domain_prefix()?;
        let rid = sid.rid().ok_or(ResponderError::NoDomain)?;
        let slice = self
            .slices
            .iter()
            .find(|s| s.domain_sid == prefix)
            .ok_or(ResponderError::NoDomain)?;
        if slice.external {
            return Err(ResponderError::ExternalSource);
        }
        if rid < slice.first_rid {
            return Err(ResponderError::NoDomain);
        }
        let offset = u64::from(rid) - u64::from(slice.first_rid);
        let id = u64::from(slice.range.min) + offset;
        if id > u64::from(slice.range.max) {
            return Err(ResponderError::NoDomain);
        }
        Ok(id as u32)
    }

    pub fn unix_to_sid(&self, id: u32) -> Result<Sid> {
        if id < self.lower || id > self.upper {
            return Err(ResponderError::NoRange);
        }
        let slice = self
            .slices
            .iter()
            .find(|s| id >= s.range.min && id <= s.range.max)
            .ok_or(ResponderError::NoRange)?;
        if slice.external {
            return Err(ResponderError::ExternalSource);
        }
        let rid = slice.first_rid + (id - slice.range.min);
        Ok(slice.domain_sid.child(rid))
    }
}

fn ranges_overlap(a: &IdRange, b: &IdRange) -> bool {
    a.min <= b.max && b.min <= a.max
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dsid(n: u32) -> Sid {
        Sid::from_str_sid(&format!("S-1-5-21-{n}-{n}-{n}")).unwrap()
    }

    #[test]
    fn round_trip_within_domain_range() {
        let mut ctx = IdmapContext::new(200_000, 2_000_000_000, 200_000, false);
        let sid = dsid(1);
        ctx.add_domain_ex("dom1", &sid, None, None, 1000, false).unwrap();

        for rid in [1000u32, 1001, 50_000] {
            let child = sid.child(rid);
            let id = ctx.sid_to_unix(&child).unwrap();
            let back = ctx.unix_to_sid(id).unwrap();
            assert_eq!(back, child);
        }
    }

    #[test]
    fn overlapping_ranges_rejected() {
        let mut ctx = IdmapContext::new(200_000, 2_000_000_000, 200_000, false);
        ctx.add_domain_ex("dom1", &dsid(1), Some(3), None, 1000, false)
            .unwrap();
        let err = ctx
            .add_domain_ex("dom2", &dsid(2), Some(3), None, 1000, false)
            .unwrap_err();
        assert!(matches!(err, ResponderError::Collision(_)));
    }

    #[test]
    fn mixed_external_flag_rejected() {
        let mut ctx = IdmapContext::new(200_000, 2_000_000_000, 200_000, false);
        ctx.add_domain_ex("dom1", &dsid(1), Some(1), None, 1000, false)
            .unwrap();
        let err = ctx
            .add_domain_ex("dom1", &dsid(1), Some(2), None, 1000, true)
            .unwrap_err();
        assert!(matches!(err, ResponderError::Collision(_)));
    }

    #[test]
    fn autorid_reserves_slice_zero() {
        let mut ctx = IdmapContext::new(0, 1_000_000, 100_000, true);
        ctx.add_domain_ex("primary", &dsid(1), None, None, 0, false)
            .unwrap();
        // second domain must not collide with slice 0.
        ctx.add_domain_ex("secondary", &dsid(2), None, None, 0, false)
            .unwrap();
        let sid1 = ctx.unix_to_sid(50).unwrap();
        assert_eq!(sid1.domain_prefix().unwrap(), dsid(1));
    }
}
