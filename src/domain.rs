//! Domain entity and the domain iterator (Component E).

use crate::sid::Sid;

#[derive(Debug, Clone)]
pub struct Domain {
    pub name: String,
    pub domain_sid: Option<Sid>,
    pub id_min: u32,
    pub id_max: u32,
    pub enumerate: bool,
    pub fqnames: bool,
    pub case_sensitive: bool,
    pub mpg: bool,
    pub override_gid: Option<u32>,
    pub override_homedir: Option<String>,
    pub fallback_homedir: Option<String>,
    pub override_shell: Option<String>,
    pub default_shell: Option<String>,
    pub subdomains: Vec<Domain>,
    /// Whether the provider has a live collaborator for this domain.
    pub has_provider: bool,
}

impl Domain {
    pub fn covers_id(&self, id: u32) -> bool {
        id >= self.id_min && id <= self.id_max
    }

    pub fn qualify(&self, name: &str) -> String {
        format!("{name}@{}", self.name)
    }

    pub fn split_fqname<'a>(&self, fqname: &'a str) -> Option<(&'a str, &'a str)> {
        fqname.split_once('@')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Name lookup against an unqualified input, possibly spanning multiple domains.
    NameMultiDomain,
    /// Name lookup where the input was already fully qualified: single-shot.
    NameQualified,
    /// ID lookup: iterate all primary domains and descend into subdomains.
    Id,
    /// SID lookup: domain preselected by SID prefix before the iterator runs.
    Sid,
    /// Enumeration: only domains with `enumerate = true`.
    Enumeration,
}

/// Ordered traversal over primary domains (and, for `Id` mode, their
/// subdomains), applying each `SearchMode`'s per-mode skip rules.
pub struct DomainIter<'a> {
    domains: &'a [Domain],
    mode: SearchMode,
    domain_idx: usize,
    sub_idx: Option<usize>,
    done: bool,
}

impl<'a> DomainIter<'a> {
    pub fn new(domains: &'a [Domain], mode: SearchMode) -> Self {
        Self {
            domains,
            mode,
            domain_idx: 0,
            sub_idx: None,
            done: matches!(mode, SearchMode::NameQualified) && domains.is_empty(),
        }
    }

    fn skip(&self, d: &Domain) -> bool {
        match self.mode {
            SearchMode::NameMultiDomain => d.fqnames,
            SearchMode::Enumeration => !d.enumerate,
            SearchMode::NameQualified | SearchMode::Id | SearchMode::Sid => false,
        }
    }
}

impl<'a> Iterator for DomainIter<'a> {
    type Item = &'a Domain;

    fn next(&mut self) -> Option<&'a Domain> {
        if self.done {
            return None;
        }
        loop {
            let Some(parent) = self.domains.get(self.domain_idx) else {
                self.done = true;
                return None;
            };

            if self.mode == SearchMode::Id {
                if let Some(si) = self.sub_idx {
                    if let Some(sub) = parent.subdomains.get(si) {
                        self.sub_idx = Some(si + 1);
                        if !self.skip(sub) {
                            return Some(sub);
                        }
                        continue;
                    } else {
                        self.sub_idx = None;
                        self.domain_idx += 1;
                        continue;
                    }
                }
            }

            if matches!(self.mode, SearchMode::NameQualified) {
                self.done = true;
                if !self.skip(parent) {
                    return Some(parent);
                }
                return None;
            }

            let idx = self.domain_idx;
            self.domain_idx += 1;
            if self.mode == SearchMode::Id && !parent.subdomains.is_empty() {
                self.sub_idx = Some(0);
            }
            let _ = idx;

            if !self.skip(parent) {
                return Some(parent);
            }
        }
    }
}

pub fn find_domain_by_sid<'a>(domains: &'a [Domain], sid: &Sid) -> Option<&'a Domain> {
    let prefix = sid.domain_prefix().ok()?;
    fn search<'a>(list: &'a [Domain], prefix: &Sid) -> Option<&'a Domain> {
        for d in list {
            if d.domain_sid.as_ref() == Some(prefix) {
                return Some(d);
            }
            if let Some(found) = search(&d.subdomains, prefix) {
                return Some(found);
            }
        }
        None
    }
    search(domains, &prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str, fqnames: bool, enumerate: bool) -> Domain {
        Domain {
            name: name.into(),
            domain_sid: None,
            id_min: 0,
            id_max: u32::MAX,
            enumerate,
            fqnames,
            case_sensitive: true,
            mpg: false,
            override_gid: None,
            override_homedir: None,
            fallback_homedir: None,
            override_shell: None,
            default_shell: None,
            subdomains: Vec::new(),
            has_provider: true,
        }
    }

    #[test]
    fn multi_domain_name_search_skips_fqnames_only_domains() {
        let domains = vec![domain("a", false, true), domain("b", true, true)];
        let got: Vec<_> = DomainIter::new(&domains, SearchMode::NameMultiDomain)
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(got, vec!["a"]);
    }

    #[test]
    fn enumeration_skips_non_enumerable_domains() {
        let domains = vec![domain("a", false, true), domain("b", false, false)];
        let got: Vec<_> = DomainIter::new(&domains, SearchMode::Enumeration)
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(got, vec!["a"]);
    }

    #[test]
    fn id_search_descends_into_subdomains() {
        let mut parent = domain("parent", false, true);
        parent.subdomains.push(domain("child", false, true));
        let domains = vec![parent];
        let got: Vec<_> = DomainIter::new(&domains, SearchMode::Id)
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(got, vec!["parent".to_string(), "child".to_string()]);
    }
}
