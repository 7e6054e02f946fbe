//! Reply encoder (Component D): length-prefixed record encoders for
//! passwd, group, initgroups, SID, ID, and name replies.
//!
//! Byte-oriented rather than bit-packed: nothing here needs sub-byte
//! fields, so `bytes::BytesMut` is used directly instead of a bit writer.

use bytes::{BufMut, BytesMut};

use crate::config::ShellConfig;
use crate::domain::Domain;
use crate::error::{ResponderError, Result};
use crate::sysdb::{GroupMembership, SysdbRecord};

pub const NOLOGIN_SHELL: &str = "/sbin/nologin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    Uid = 1,
    Gid = 2,
    Both = 3,
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Applies homedir/shell/GID override policy for a single passwd record,
/// returning the effective `(homedir, shell, gid)`. Shell resolution runs
/// the domain override, then the global `shells` policy's override, then
/// the record's own shell filtered through `shells`' veto/allow lists,
/// before falling back to `shells.shell_fallback`/`domain.default_shell`.
pub fn resolve_passwd_overrides(
    record: &SysdbRecord,
    domain: &Domain,
    shells: &ShellConfig,
) -> (String, String, u32) {
    let homedir = if let Some(tpl) = &domain.override_homedir {
        tpl.replace("%u", &record.name)
    } else if let Some(h) = &record.homedir {
        if h.is_empty() {
            fallback_homedir(record, domain)
        } else {
            h.clone()
        }
    } else {
        fallback_homedir(record, domain)
    };

    let shell = resolve_shell(record, domain, shells);
    let gid = domain.override_gid.unwrap_or(record.gid.unwrap_or(0));

    (homedir, shell, gid)
}

/// Domain override wins unconditionally, then the global override, then
/// the record's own shell if it clears the veto/allow lists, then the
/// configured fallback chain, and `NOLOGIN_SHELL` as the last resort.
fn resolve_shell(record: &SysdbRecord, domain: &Domain, shells: &ShellConfig) -> String {
    if let Some(s) = &domain.override_shell {
        return s.clone();
    }
    if let Some(s) = &shells.override_shell {
        return s.clone();
    }

    let candidate = record.shell.as_deref().filter(|s| !s.is_empty());
    let accepted = candidate.filter(|s| {
        !shells.vetoed_shells.iter().any(|v| v == s)
            && (shells.allowed_shells.is_empty() || shells.allowed_shells.iter().any(|a| a == s))
    });
    if let Some(s) = accepted {
        return s.to_string();
    }

    shells
        .shell_fallback
        .clone()
        .or_else(|| domain.default_shell.clone())
        .unwrap_or_else(|| NOLOGIN_SHELL.to_string())
}

fn fallback_homedir(record: &SysdbRecord, domain: &Domain) -> String {
    domain
        .fallback_homedir
        .as_ref()
        .map(|tpl| tpl.replace("%u", &record.name))
        .unwrap_or_default()
}

pub fn encode_passwd_reply(entries: &[(SysdbRecord, Domain)], shells: &ShellConfig) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(entries.len() as u32);
    buf.put_u32_le(0);
    for (record, domain) in entries {
        let (homedir, shell, gid) = resolve_passwd_overrides(record, domain, shells);
        buf.put_u32_le(record.uid.unwrap_or(0));
        buf.put_u32_le(gid);
        put_cstr(&mut buf, &domain.qualify(&record.name));
        put_cstr(&mut buf, "x");
        put_cstr(&mut buf, record.gecos.as_deref().unwrap_or(""));
        put_cstr(&mut buf, &homedir);
        put_cstr(&mut buf, &shell);
    }
    buf
}

/// Encodes the same fields `encode_passwd_reply` puts on the wire into a
/// single record's shared-memory cache payload, so a slot hit can be
/// served without a persistent-cache round trip.
pub fn encode_passwd_mcache_payload(record: &SysdbRecord, domain: &Domain, shells: &ShellConfig) -> Vec<u8> {
    let (homedir, shell, gid) = resolve_passwd_overrides(record, domain, shells);
    let mut buf = BytesMut::new();
    buf.put_u32_le(record.uid.unwrap_or(0));
    buf.put_u32_le(gid);
    put_cstr(&mut buf, &domain.qualify(&record.name));
    put_cstr(&mut buf, record.gecos.as_deref().unwrap_or(""));
    put_cstr(&mut buf, &homedir);
    put_cstr(&mut buf, &shell);
    buf.to_vec()
}

/// Group-record shared-memory cache payload: fqname, gid, member count,
/// then each member's gid. Mirrors the group's full set of membership
/// links (no posix filtering, unlike `encode_initgroups_reply`) since this
/// slot stands in for the persistent-cache record itself.
pub fn encode_group_mcache_payload(record: &SysdbRecord, domain: &Domain) -> Vec<u8> {
    let gid = domain.override_gid.unwrap_or(record.gid.unwrap_or(0));
    let mut buf = BytesMut::new();
    put_cstr(&mut buf, &domain.qualify(&record.name));
    buf.put_u32_le(gid);
    buf.put_u32_le(record.members.len() as u32);
    for m in &record.members {
        buf.put_u32_le(m.gid);
    }
    buf.to_vec()
}

pub fn encode_group_reply(entries: &[(SysdbRecord, Domain, Vec<String>)]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(entries.len() as u32);
    buf.put_u32_le(0);
    for (record, domain, member_names) in entries {
        let gid = domain.override_gid.unwrap_or(record.gid.unwrap_or(0));
        buf.put_u32_le(gid);
        buf.put_u32_le(member_names.len() as u32);
        put_cstr(&mut buf, &domain.qualify(&record.name));
        put_cstr(&mut buf, "x");
        for m in member_names {
            put_cstr(&mut buf, m);
        }
    }
    buf
}

/// `primary_gid` is the user's current primary GID; `original_primary_gid`
/// is appended only if present, non-zero, and not already in `gids`.
///
/// Non-POSIX memberships are skipped: they are real directory links but
/// must never appear in an initgroups result. A `gid == 0` membership
/// without the `posix` flag set signals a corrupted record (no legitimate
/// group has gid 0), which aborts the whole reply rather than risk handing
/// a caller a bogus root-group membership.
pub fn encode_initgroups_reply(
    members: &[GroupMembership],
    primary_gid: u32,
    original_primary_gid: Option<u32>,
) -> Result<BytesMut> {
    let mut out: Vec<u32> = Vec::with_capacity(members.len());
    for m in members {
        if m.gid == 0 && !m.posix {
            return Err(ResponderError::Fatal(
                "initgroups membership with gid 0 and no posix flag: record corruption".into(),
            ));
        }
        if m.posix && !out.contains(&m.gid) {
            out.push(m.gid);
        }
    }
    if primary_gid != 0 && !out.contains(&primary_gid) {
        out.push(primary_gid);
    }
    if let Some(orig) = original_primary_gid {
        if orig != 0 && !out.contains(&orig) {
            out.push(orig);
        }
    }

    let mut buf = BytesMut::new();
    buf.put_u32_le(out.len() as u32);
    buf.put_u32_le(0);
    for gid in out {
        buf.put_u32_le(gid);
    }
    Ok(buf)
}

pub fn encode_sid_reply(id_type: IdType, sid: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(1);
    buf.put_u32_le(0);
    buf.put_u32_le(id_type as u32);
    put_cstr(&mut buf, sid);
    buf
}

pub fn encode_id_reply(id_type: IdType, id: u32) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(1);
    buf.put_u32_le(0);
    buf.put_u32_le(id_type as u32);
    buf.put_u32_le(id);
    buf
}

pub fn encode_name_reply(id_type: IdType, fqname: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(1);
    buf.put_u32_le(0);
    buf.put_u32_le(id_type as u32);
    put_cstr(&mut buf, fqname);
    buf
}

/// Service reply, in the same entry-count-prefixed shape as passwd/group:
/// for each entry, `port(2) | proto\0 | fqname\0 | [alias\0]*`.
pub fn encode_service_reply(entries: &[crate::sysdb::ServiceRecord]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(entries.len() as u32);
    buf.put_u32_le(0);
    for svc in entries {
        buf.put_u16_le(svc.port);
        put_cstr(&mut buf, &svc.proto);
        put_cstr(&mut buf, &svc.name);
        buf.put_u32_le(svc.aliases.len() as u32);
        for alias in &svc.aliases {
            put_cstr(&mut buf, alias);
        }
    }
    buf
}

pub fn empty_reply() -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(0);
    buf.put_u32_le(0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_domain() -> Domain {
        Domain {
            name: "dom".into(),
            domain_sid: None,
            id_min: 0,
            id_max: u32::MAX,
            enumerate: true,
            fqnames: false,
            case_sensitive: true,
            mpg: false,
            override_gid: None,
            override_homedir: None,
            fallback_homedir: Some("/home/%u".into()),
            override_shell: None,
            default_shell: Some("/bin/bash".into()),
            subdomains: vec![],
            has_provider: true,
        }
    }

    fn test_record() -> SysdbRecord {
        SysdbRecord {
            name: "alice".into(),
            aliases: vec![],
            uid: Some(1000),
            gid: Some(1000),
            class: crate::sysdb::PosixClass::User,
            sid: None,
            gecos: Some("Alice".into()),
            homedir: None,
            shell: None,
            members: vec![],
            original_primary_gid: None,
            cache_expire: 0,
            initgroups_expire: None,
        }
    }

    fn member(gid: u32) -> GroupMembership {
        GroupMembership { gid, posix: true }
    }

    #[test]
    fn passwd_reply_applies_fallback_homedir_and_default_shell() {
        let buf = encode_passwd_reply(&[(test_record(), test_domain())], &ShellConfig::default());
        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("/home/alice"));
        assert!(text.contains("/bin/bash"));
        assert!(text.contains("alice@dom"));
    }

    #[test]
    fn initgroups_appends_nonzero_original_primary_gid() {
        let buf = encode_initgroups_reply(&[member(2000), member(2001)], 1000, Some(999)).unwrap();
        assert_eq!(&buf[0..4], &4u32.to_le_bytes());
    }

    #[test]
    fn initgroups_skips_duplicate_original_primary_gid() {
        let buf = encode_initgroups_reply(&[member(1000), member(2001)], 1000, Some(1000)).unwrap();
        assert_eq!(&buf[0..4], &2u32.to_le_bytes());
    }

    #[test]
    fn initgroups_skips_non_posix_memberships() {
        let members = [member(2000), GroupMembership { gid: 2001, posix: false }];
        let buf = encode_initgroups_reply(&members, 1000, None).unwrap();
        assert_eq!(&buf[0..4], &2u32.to_le_bytes());
    }

    #[test]
    fn initgroups_rejects_gid_zero_without_posix_flag() {
        let members = [GroupMembership { gid: 0, posix: false }];
        assert!(encode_initgroups_reply(&members, 1000, None).is_err());
    }

    #[test]
    fn empty_reply_has_zero_count() {
        let buf = empty_reply();
        assert_eq!(buf.len(), 8);
    }
}
