//! SID binary/string codec (Component A, format half).
//!
//! A SID is `revision(1) | subauth_count(1) | authority(6, big-endian) |
//! subauth[subauth_count](4 each, little-endian)`. String form is
//! `S-R-A-S0-S1-...`. A domain SID has `subauth_count >= 4` and its string
//! form starts with the configurable `S-1-5-21-` prefix.

use crate::error::{ResponderError, Result};

pub const DOMAIN_SID_PREFIX: &str = "S-1-5-21-";
const MAX_SUB_AUTHORITIES: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sid {
    pub revision: u8,
    pub authority: u64,
    pub sub_authorities: Vec<u32>,
}

impl Sid {
    pub fn rid(&self) -> Option<u32> {
        self.sub_authorities.last().copied()
    }

    pub fn is_domain_sid(&self) -> bool {
        self.sub_authorities.len() >= 4 && self.to_string().starts_with(DOMAIN_SID_PREFIX)
    }

    /// The domain-SID prefix of this SID, i.e. this SID with its final RID
    /// dropped. Fails if there is no sub-authority to drop.
    pub fn domain_prefix(&self) -> Result<Sid> {
        if self.sub_authorities.is_empty() {
            return Err(ResponderError::InvalidSid("no sub-authorities".into()));
        }
        Ok(Sid {
            revision: self.revision,
            authority: self.authority,
            sub_authorities: self.sub_authorities[..self.sub_authorities.len() - 1].to_vec(),
        })
    }

    pub fn child(&self, rid: u32) -> Sid {
        let mut sub = self.sub_authorities.clone();
        sub.push(rid);
        Sid {
            revision: self.revision,
            authority: self.authority,
            sub_authorities: sub,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.sub_authorities.len() * 4);
        out.push(self.revision);
        out.push(self.sub_authorities.len() as u8);
        // 6-byte big-endian authority.
        let auth_bytes = self.authority.to_be_bytes();
        out.extend_from_slice(&auth_bytes[2..8]);
        for sub in &self.sub_authorities {
            out.extend_from_slice(&sub.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Sid> {
        if buf.len() < 8 {
            return Err(ResponderError::InvalidSid("too short".into()));
        }
        let revision = buf[0];
        let count = buf[1] as usize;
        if count > MAX_SUB_AUTHORITIES || buf.len() != 8 + count * 4 {
            return Err(ResponderError::InvalidSid("bad sub-authority count".into()));
        }
        let mut auth_bytes = [0u8; 8];
        auth_bytes[2..8].copy_from_slice(&buf[2..8]);
        let authority = u64::from_be_bytes(auth_bytes);
        let mut sub_authorities = Vec::with_capacity(count);
        for i in 0..count {
            let off = 8 + i * 4;
            sub_authorities.push(u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()));
        }
        Ok(Sid {
            revision,
            authority,
            sub_authorities,
        })
    }

    pub fn from_str_sid(s: &str) -> Result<Sid> {
        let mut parts = s.split('-');
        if parts.next() != Some("S") {
            return Err(ResponderError::InvalidSid(s.to_string()));
        }
        let revision: u8 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| ResponderError::InvalidSid(s.to_string()))?;
        let authority: u64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| ResponderError::InvalidSid(s.to_string()))?;
        let sub_authorities: Vec<u32> = parts
            .map(|p| p.parse::<u32>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| ResponderError::InvalidSid(s.to_string()))?;
        if sub_authorities.is_empty() || sub_authorities.len() > MAX_SUB_AUTHORITIES {
            return Err(ResponderError::InvalidSid(s.to_string()));
        }
        Ok(Sid {
            revision,
            authority,
            sub_authorities,
        })
    }
}

impl std::fmt::Display for Sid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S-{}-{}", self.revision, self.authority)?;
        for sub in &self.sub_authorities {
            write!(f, "-{sub}")?;
        }
        Ok(())
    }
}

pub fn is_domain_sid(s: &str) -> bool {
    Sid::from_str_sid(s)
        .map(|sid| sid.is_domain_sid())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_bin_struct_round_trip() {
        let s = "S-1-5-21-1111111111-2222222222-3333333333-500";
        let sid = Sid::from_str_sid(s).unwrap();
        assert_eq!(sid.to_string(), s);

        let bytes = sid.to_bytes();
        let back = Sid::from_bytes(&bytes).unwrap();
        assert_eq!(back, sid);
    }

    #[test]
    fn domain_sid_detection() {
        assert!(is_domain_sid(
            "S-1-5-21-1111111111-2222222222-3333333333-500"
        ));
        assert!(!is_domain_sid("S-1-5-32-544"));
    }

    #[test]
    fn rejects_malformed() {
        assert!(Sid::from_str_sid("not-a-sid").is_err());
        assert!(Sid::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn domain_prefix_and_child() {
        let sid = Sid::from_str_sid("S-1-5-21-1-2-3-500").unwrap();
        let prefix = sid.domain_prefix().unwrap();
        assert_eq!(prefix.to_string(), "S-1-5-21-1-2-3");
        assert_eq!(prefix.child(500), sid);
    }
}
