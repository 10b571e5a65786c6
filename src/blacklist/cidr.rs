//! A longest-prefix CIDR membership set. Backed by a hash map keyed on
//! `(masked address, prefix length)` plus a linear scan bounded by the
//! address width, which is adequate for the rule-set sizes this engine
//! expects to load; a true radix trie is a possible future optimization if
//! profiling ever shows the scan matters.

use super::AddOutcome;
use rustc_hash::FxHashMap;
use std::net::IpAddr;

#[derive(Default)]
pub struct CidrSet {
    v4: FxHashMap<(u32, u8), ()>,
    v6: FxHashMap<(u128, u8), ()>,
}

impl CidrSet {
    pub fn insert(&mut self, addr: IpAddr, prefix_bits: u8) -> AddOutcome {
        match addr {
            IpAddr::V4(v4) => {
                let masked = mask_v4(u32::from(v4), prefix_bits);
                let key = (masked, prefix_bits);
                if self.v4.contains_key(&key) {
                    AddOutcome::AlreadyPresent
                } else {
                    self.v4.insert(key, ());
                    AddOutcome::Ok
                }
            }
            IpAddr::V6(v6) => {
                let masked = mask_v6(u128::from(v6), prefix_bits);
                let key = (masked, prefix_bits);
                if self.v6.contains_key(&key) {
                    AddOutcome::AlreadyPresent
                } else {
                    self.v6.insert(key, ());
                    AddOutcome::Ok
                }
            }
        }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => {
                let value = u32::from(*v4);
                (0..=32).rev().any(|bits| self.v4.contains_key(&(mask_v4(value, bits), bits)))
            }
            IpAddr::V6(v6) => {
                let value = u128::from(*v6);
                (0..=128).rev().any(|bits| self.v6.contains_key(&(mask_v6(value, bits), bits)))
            }
        }
    }
}

fn mask_v4(value: u32, prefix_bits: u8) -> u32 {
    if prefix_bits == 0 {
        0
    } else {
        value & (u32::MAX << (32 - prefix_bits as u32))
    }
}

fn mask_v6(value: u128, prefix_bits: u8) -> u128 {
    if prefix_bits == 0 {
        0
    } else {
        value & (u128::MAX << (128 - prefix_bits as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_host_match() {
        let mut set = CidrSet::default();
        set.insert("1.1.1.1".parse().unwrap(), 32);
        assert!(set.contains(&"1.1.1.1".parse().unwrap()));
        assert!(!set.contains(&"1.1.1.2".parse().unwrap()));
    }

    #[test]
    fn subnet_match() {
        let mut set = CidrSet::default();
        set.insert("10.0.0.0".parse().unwrap(), 8);
        assert!(set.contains(&"10.1.2.3".parse().unwrap()));
        assert!(!set.contains(&"11.0.0.0".parse().unwrap()));
    }

    #[test]
    fn duplicate_prefix_insert_is_already_present() {
        let mut set = CidrSet::default();
        assert_eq!(set.insert("10.0.0.0".parse().unwrap(), 8), AddOutcome::Ok);
        assert_eq!(
            set.insert("10.0.0.0".parse().unwrap(), 8),
            AddOutcome::AlreadyPresent
        );
    }
}
