use super::{compare_sentinels, Parser};
use crate::error::{Error, Result};
use std::cmp::Ordering;

/// Debian package versions: `[epoch:]upstream[-revision]`.
///
/// Ordering follows dpkg: letters sort before non-letters, `~` sorts before
/// everything including the end of the string, and digit runs compare
/// numerically.
#[derive(Debug, Clone, Copy, Default)]
pub struct DpkgParser;

struct DpkgVersion<'a> {
    epoch: u64,
    upstream: &'a str,
    revision: &'a str,
}

impl DpkgParser {
    pub const NAME: &'static str = "dpkg";

    fn parse(version: &str) -> Result<DpkgVersion<'_>> {
        let invalid = || Error::InvalidVersion {
            format: Self::NAME.to_string(),
            version: version.to_string(),
        };

        let version = version.trim();
        let (epoch, rest) = match version.split_once(':') {
            Some((epoch, rest)) => (epoch.parse::<u64>().map_err(|_| invalid())?, rest),
            None => (0, version),
        };
        let (upstream, revision) = match rest.rsplit_once('-') {
            Some((upstream, revision)) => (upstream, revision),
            None => (rest, ""),
        };

        if !upstream.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let allowed = |c: char| c.is_ascii_alphanumeric() || ".+~-:".contains(c);
        if !upstream.chars().all(allowed) || !revision.chars().all(allowed) {
            return Err(invalid());
        }

        Ok(DpkgVersion {
            epoch,
            upstream,
            revision,
        })
    }
}

fn char_order(c: Option<u8>) -> i32 {
    match c {
        None => 0,
        Some(b'~') => -1,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => i32::from(c),
        Some(c) => i32::from(c) + 256,
    }
}

fn is_digit(c: Option<u8>) -> bool {
    c.is_some_and(|c| c.is_ascii_digit())
}

fn compare_fragment(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let (mut i, mut j) = (0, 0);

    while i < a.len() || j < b.len() {
        while (i < a.len() && !a[i].is_ascii_digit()) || (j < b.len() && !b[j].is_ascii_digit()) {
            let ac = char_order(a.get(i).copied());
            let bc = char_order(b.get(j).copied());
            if ac != bc {
                return ac.cmp(&bc);
            }
            i += 1;
            j += 1;
        }

        while a.get(i) == Some(&b'0') {
            i += 1;
        }
        while b.get(j) == Some(&b'0') {
            j += 1;
        }

        let mut first_diff = Ordering::Equal;
        while is_digit(a.get(i).copied()) && is_digit(b.get(j).copied()) {
            if first_diff == Ordering::Equal {
                first_diff = a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }
        if is_digit(a.get(i).copied()) {
            return Ordering::Greater;
        }
        if is_digit(b.get(j).copied()) {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }

    Ordering::Equal
}

impl Parser for DpkgParser {
    fn valid(&self, version: &str) -> bool {
        compare_sentinels(version, version).is_some() || Self::parse(version).is_ok()
    }

    fn compare(&self, a: &str, b: &str) -> Result<Ordering> {
        if let Some(ordering) = compare_sentinels(a, b) {
            return Ok(ordering);
        }
        if a == b {
            return Ok(Ordering::Equal);
        }

        let (a, b) = (Self::parse(a)?, Self::parse(b)?);
        Ok(a.epoch
            .cmp(&b.epoch)
            .then_with(|| compare_fragment(a.upstream, b.upstream))
            .then_with(|| compare_fragment(a.revision, b.revision)))
    }

    fn namespaces(&self) -> Vec<String> {
        vec!["debian".to_string(), "ubuntu".to_string()]
    }
}
